mod load;
mod types;

pub use load::{get_state_home_dir, load_default, load_from_path};
pub use types::*;
