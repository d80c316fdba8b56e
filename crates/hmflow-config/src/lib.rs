//! Solve descriptions and volume files for hmflow.
//!
//! This crate turns TOML solve descriptions and raw volume files into the
//! inputs hmflow-core expects, and writes results back out.
//!
//! # Features
//!
//! - **Solve files**: Label tree, grid, parameters, and volume paths in TOML
//! - **Volume I/O**: Raw little-endian `f32` volumes sized by the grid
//! - **Validation**: Structural checks with every problem reported at once
//! - **Paths**: Platform config directory and user parameter defaults
//! - **Phantoms**: Synthetic problems for demos and tests
//!
//! # Example
//!
//! ```rust,no_run
//! use hmflow_config::{UserDefaults, load_setup};
//!
//! let defaults = UserDefaults::load().unwrap();
//! let setup = load_setup("runs/phantom/solve.toml", &defaults.params).unwrap();
//! println!("{} leaves on {}", setup.hierarchy.leaves().count(), setup.extent);
//! ```

mod error;
mod solve_file;

/// Platform-specific paths and user defaults.
pub mod paths;

/// Synthetic problems.
pub mod phantom;

/// Solve file validation.
pub mod validation;

/// Raw volume files.
pub mod volume_io;

pub use error::ConfigError;
pub use paths::{UserDefaults, defaults_path, ensure_user_config_dir, user_config_dir};
pub use phantom::{Phantom, SOLVE_FILE_NAME};
pub use solve_file::{
    ExtentConfig, NodeConfig, ParamsConfig, SolveFile, SolveSetup, load_setup, resolve,
};
pub use validation::{ValidationError, ValidationResult, validate_solve_file};
pub use volume_io::{decode_volume, encode_volume, read_volume, write_volume};
