// Runtime configuration for the interpreter host.

use ron::de::from_reader;
use serde::Deserialize;
use std::fs::File;


#[derive(Deserialize, Debug, Copy, Clone)]
pub struct VmConfig {
    pub stack_size: usize,
    pub trace: bool,
}

impl Default for VmConfig {
    fn default() -> VmConfig {
        VmConfig {
            stack_size: crate::vm::DEFAULT_STACK_SIZE,
            trace: false,
        }
    }
}

pub type LoadResult = std::result::Result<VmConfig, String>;

pub fn load(path: &str) -> LoadResult {
    if let Ok(file) = File::open(path) {
        from_reader(file).map_err(|e| e.to_string())
    } else {
        Err(String::from("Couldn't open file"))
    }
}
