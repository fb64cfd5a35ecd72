//! Path utilities for warden data directories.

use std::path::PathBuf;

/// File name of the model used when none is configured.
pub const DEFAULT_MODEL_FILENAME: &str = "model.gguf";

/// Get the warden data directory (~/.warden/).
///
/// Falls back to `./.warden` when no home directory can be determined.
pub fn warden_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".warden")
}

/// Get the models directory (~/.warden/models/).
pub fn models_dir() -> PathBuf {
    warden_data_dir().join("models")
}

/// Get the bin directory (~/.warden/bin/).
pub fn bin_dir() -> PathBuf {
    warden_data_dir().join("bin")
}

/// Get the records directory evicted by `serve` (~/.warden/records/).
pub fn records_dir() -> PathBuf {
    warden_data_dir().join("records")
}

/// Get the path to the llama-server binary.
pub fn llama_server_path() -> PathBuf {
    let binary_name = if cfg!(target_os = "windows") {
        "llama-server.exe"
    } else {
        "llama-server"
    };
    bin_dir().join(binary_name)
}

/// Get the path to the default model file.
pub fn default_model_path() -> PathBuf {
    models_dir().join(DEFAULT_MODEL_FILENAME)
}
