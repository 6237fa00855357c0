pub mod checkpoint_loader;

pub use checkpoint_loader::{load_network, load_var_builder};
