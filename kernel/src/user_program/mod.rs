pub mod elf;
pub mod loader;

pub use loader::{load_executable, LoadError, LoadedProgram};
