//! Static phase -> working-directory/recipe mapping (§4.4). This is the one
//! extensibility seam meant for future phase implementations: adding a
//! phase means adding one table entry here, not touching the runner.

use std::path::{Path, PathBuf};

/// How a phase's script gets invoked. The original orchestrator never spawns
/// a phase script directly — it always goes through an interpreter or a
/// project-managed toolchain (`poetry run python ...`, plain `sys.executable`
/// for standalone scripts), so the environment stripping in `runner.rs`
/// actually matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launcher {
    /// `<python> <script>`, the original's `sys.executable` invocations
    /// (phase 4's `engine_runner.py`).
    Python,
    /// `poetry run python <script>`, for phases living inside a
    /// Poetry-managed subproject (phases 1-3).
    PoetryScript,
    /// `poetry run python -m <module>`, for phases invoked as a package
    /// module because the script uses relative imports (phase 5 / 5.5).
    PoetryModule,
}

#[derive(Debug, Clone)]
pub struct PhaseRecipe {
    pub working_dir: PathBuf,
    pub launcher: Launcher,
    /// Script path (relative to `working_dir`) for `Python`/`PoetryScript`,
    /// or a dotted module name for `PoetryModule`.
    pub target: String,
    pub fixed_args: Vec<String>,
}

/// `root` is the directory phase executables resolve their own relative
/// paths against: `Config::monorepo_root()` when set, else the project dir.
pub fn recipe_for(phase: &str, root: &Path, engine: Option<&str>) -> PhaseRecipe {
    match phase {
        "phase1" => PhaseRecipe {
            working_dir: root.join("phase1_validation"),
            launcher: Launcher::PoetryScript,
            target: "validate_source.py".into(),
            fixed_args: vec![],
        },
        "phase2" => PhaseRecipe {
            working_dir: root.join("phase2_extraction"),
            launcher: Launcher::PoetryScript,
            target: "extract_text.py".into(),
            fixed_args: vec![],
        },
        "phase3" => PhaseRecipe {
            working_dir: root.join("phase3_chunking"),
            launcher: Launcher::PoetryScript,
            target: "chunk_text.py".into(),
            fixed_args: vec![],
        },
        "phase4" => {
            let engine = engine.unwrap_or("xtts");
            PhaseRecipe {
                working_dir: root.join("phase4_tts"),
                launcher: Launcher::Python,
                target: "engine_runner.py".into(),
                fixed_args: vec![format!("--engine={engine}")],
            }
        }
        "phase5" => PhaseRecipe {
            working_dir: root.join("phase5_enhancement"),
            launcher: Launcher::PoetryModule,
            target: "phase5_enhancement.main".into(),
            fixed_args: vec![],
        },
        "phase5_5" => PhaseRecipe {
            working_dir: root.join("phase5_enhancement"),
            launcher: Launcher::PoetryModule,
            target: "phase5_enhancement.subtitles".into(),
            fixed_args: vec![],
        },
        other => PhaseRecipe {
            working_dir: root.join(other),
            launcher: Launcher::Python,
            target: format!("{other}.py"),
            fixed_args: vec![],
        },
    }
}

/// Directory phase 4 writes enhanced chunk WAVs into for a given `file_id`,
/// used by phase 5's concat-only fast-path probe.
pub fn enhanced_chunk_dir(root: &Path, file_id: &str) -> PathBuf {
    root.join("phase4_tts/output").join(file_id)
}
