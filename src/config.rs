// Run configuration for a machine, loaded from a RON file.

use std::fs::File;

use ron::de::from_reader;
use serde::Deserialize;

use crate::codec::Profile;
use crate::error::{self, Result};


#[derive(Deserialize, Debug, Clone)]
pub enum OutputTarget {
    Console,
    File(String),
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RunConfig {
    pub profile: Profile,
    pub precompiled_link: bool,
    pub precompiled_link_dir: String,
    pub output: OutputTarget,
    pub buffer_threshold: usize,
}

impl Default for RunConfig {
    fn default() -> RunConfig {
        RunConfig {
            profile: Profile::Debug,
            precompiled_link: false,
            precompiled_link_dir: "./lib".to_string(),
            output: OutputTarget::Console,
            buffer_threshold: 20 * 1024,
        }
    }
}

pub fn load(path: &str) -> Result<RunConfig> {
    let file = File::open(path)
        .map_err(|e| error::file_err(path, &format!("Open failed: {}", e)))?;
    from_reader(file).map_err(|e| {
        error::value_err(
            vec![format!("Run configuration does not parse: {}", e)],
            vec!["The configuration file is RON over the RunConfig structure.".to_string()],
        )
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.profile, Profile::Debug);
        assert!(!config.precompiled_link);
        assert_eq!(config.buffer_threshold, 20 * 1024);
    }

    #[test]
    fn test_load_partial_ron() {
        let dir = std::env::temp_dir().join(format!("rvm-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("run.ron");
        std::fs::write(&path, "(profile: Release, precompiled_link: true)").unwrap();
        let config = load(&path.to_string_lossy()).unwrap();
        assert_eq!(config.profile, Profile::Release);
        assert!(config.precompiled_link);
        assert_eq!(config.precompiled_link_dir, "./lib");
    }
}
