//! Node configuration, stored as one json object per module.

use crate::*;

/// A module's configuration section.
///
/// Sections are read once when a node is built, there is no live
/// reconfiguration. Fields should carry `#[serde(default)]` so a section
/// written by hand may leave any of them out.
pub trait ModConfig:
    'static
    + Sized
    + Default
    + std::fmt::Debug
    + serde::Serialize
    + serde::de::DeserializeOwned
    + Send
    + Sync
{
}

fn to_section<M: ModConfig>(config: &M) -> FetchResult<serde_json::Value> {
    serde_json::to_value(config)
        .map_err(|err| FetchError::other_src("encode module config", err))
}

fn from_section<M: ModConfig>(section: &serde_json::Value) -> FetchResult<M> {
    serde_json::from_value(section.clone())
        .map_err(|err| FetchError::other_src("decode module config", err))
}

/// Node configuration, keyed by module name.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Config(serde_json::Map<String, serde_json::Value>);

impl Config {
    /// Add the default section of a module, as when writing out a fresh
    /// configuration file. Fails if the module name is taken.
    pub fn add_default_module_config<M: ModConfig>(
        &mut self,
        module_name: String,
    ) -> FetchResult<()> {
        if self.0.contains_key(&module_name) {
            return Err(FetchError::other(format!(
                "module {module_name} is already configured"
            )));
        }
        self.0.insert(module_name, to_section(&M::default())?);
        Ok(())
    }

    /// Replace the section of a module.
    pub fn set_module_config<M: ModConfig>(
        &mut self,
        module_name: String,
        config: &M,
    ) -> FetchResult<()> {
        self.0.insert(module_name, to_section(config)?);
        Ok(())
    }

    /// Read the section of a module. A missing section yields the
    /// module's defaults, unknown fields in a section are ignored.
    pub fn get_module_config<M: ModConfig>(
        &self,
        module_name: &str,
    ) -> FetchResult<M> {
        match self.0.get(module_name) {
            Some(section) => from_section(section),
            None => Ok(M::default()),
        }
    }
}
