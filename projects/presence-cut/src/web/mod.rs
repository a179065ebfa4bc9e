pub mod api;
pub mod server;

use crate::engine::Engine;
use std::path::PathBuf;

pub struct AppState {
    pub engine: Engine,
    pub upload_root: PathBuf,
}
