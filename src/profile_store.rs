use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::gpu_data::{ClockFreqs, CoolerState};

pub const DEFAULT_PROFILE_NAME: &str = "Default";

const APP_JSON: &str = "App";
const APPLY_ON_START_JSON: &str = "apply_on_start";
const PROFILES_JSON: &str = "Profiles";

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("no user configuration directory found")]
    NoConfigDir,
    #[error("profile \"{name}\" already exists for GPU {uuid}")]
    DuplicateName { uuid: String, name: String },
    #[error("no profile \"{name}\" for GPU {uuid}")]
    UnknownProfile { uuid: String, name: String },

    #[error("failed to read the profiles document {}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write the profiles document {}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize the profiles document")]
    Serialize(#[from] serde_json::Error),
}

// Settings saved for one GPU under a user chosen name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    // Percent of the default power limit, stored only
    pub power_limit: i32,
    #[serde(rename = "coreClock")]
    pub core_clock_offset: i32,
    #[serde(rename = "memClock")]
    pub mem_clock_offset: i32,
    pub manual_fan_control: bool,
    pub fan_speed: i32,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            power_limit: 100,
            core_clock_offset: 0,
            mem_clock_offset: 0,
            manual_fan_control: false,
            fan_speed: 0,
        }
    }
}

impl Profile {
    // Build a profile from the live settings of a GPU. The fan speed is
    // only kept when the fan is under manual control
    pub fn capture(
        power_limit: i32,
        offsets: ClockFreqs,
        cooler: CoolerState,
    ) -> Self {
        Self {
            power_limit,
            core_clock_offset: offsets.core,
            mem_clock_offset: offsets.mem,
            manual_fan_control: cooler.is_manual,
            fan_speed: if cooler.is_manual {
                cooler.target_level
            } else {
                0
            },
        }
    }

    // Every field is read on its own, missing or malformed ones are zero
    fn from_value(value: &Value) -> Self {
        let int = |key: &str| value.get(key).and_then(json_int).unwrap_or(0);

        Self {
            power_limit: int("powerLimit"),
            core_clock_offset: int("coreClock"),
            mem_clock_offset: int("memClock"),
            manual_fan_control: value
                .get("manualFanControl")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            fan_speed: int("fanSpeed"),
        }
    }
}

// Whole-number floats such as 100.0 are accepted as integers
fn json_int(value: &Value) -> Option<i32> {
    let int = value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0)
            .map(|f| f as i64)
    })?;

    i32::try_from(int).ok()
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
struct AppSection {
    apply_on_start: BTreeMap<String, String>,
}

// In-memory form of the profiles document. Profiles are keyed by GPU
// UUID then by name, each UUID has at most one apply on start marker
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileDocument {
    #[serde(rename = "App")]
    app: AppSection,
    #[serde(rename = "Profiles")]
    profiles: BTreeMap<String, BTreeMap<String, Profile>>,
}

impl ProfileDocument {
    // Parse a document, the parts that can't be understood are dropped
    // and the rest is kept
    pub fn parse(text: &str) -> Self {
        let root: Value = match serde_json::from_str(text) {
            Ok(root) => root,
            Err(err) => {
                warn!("Profiles document is not valid JSON, ignoring it: {err}");
                return Self::default();
            }
        };

        let mut document = Self::default();

        let markers = root
            .get(APP_JSON)
            .and_then(|app| app.get(APPLY_ON_START_JSON))
            .and_then(Value::as_object);

        for (uuid, name) in markers.into_iter().flatten() {
            match name.as_str() {
                Some(name) => {
                    document
                        .app
                        .apply_on_start
                        .insert(uuid.clone(), name.to_string());
                }
                None => warn!("Ignoring malformed apply on start entry for {uuid}"),
            }
        }

        let gpus = root.get(PROFILES_JSON).and_then(Value::as_object);

        for (uuid, profiles) in gpus.into_iter().flatten() {
            let profiles = profiles
                .as_object()
                .map(Map::iter)
                .into_iter()
                .flatten()
                .map(|(name, profile)| {
                    (name.clone(), Profile::from_value(profile))
                })
                .collect();

            document.profiles.insert(uuid.clone(), profiles);
        }

        document
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

// Persistent store of the per GPU profiles. Every mutation rewrites
// the whole document before returning, a mutation that can't be
// written is rolled back
#[derive(Debug)]
pub struct ProfileStore {
    path: PathBuf,
    document: ProfileDocument,
}

impl ProfileStore {
    // Load the store from the given document path. A missing document
    // gives an empty store
    pub fn open(config_path: Option<&Path>) -> Result<Self, ProfileError> {
        let path = config_path.ok_or(ProfileError::NoConfigDir)?.to_path_buf();

        let document = match fs::read_to_string(&path) {
            Ok(text) => ProfileDocument::parse(&text),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!(
                    "No profiles document at {}, starting empty",
                    path.display()
                );
                ProfileDocument::default()
            }
            Err(source) => return Err(ProfileError::Load { path, source }),
        };

        debug!(
            "Loaded profiles for {} GPU(s) from {}",
            document.profiles.len(),
            path.display()
        );

        Ok(Self { path, document })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> &ProfileDocument {
        &self.document
    }

    // Return the profiles of a GPU, a GPU seen for the first time gets a
    // default profile which is saved right away
    pub fn get_profiles(
        &mut self,
        uuid: &str,
    ) -> Result<BTreeMap<String, Profile>, ProfileError> {
        if !self.document.profiles.contains_key(uuid) {
            let defaults = BTreeMap::from([(
                DEFAULT_PROFILE_NAME.to_string(),
                Profile::default(),
            )]);

            self.commit(|document| {
                document.profiles.insert(uuid.to_string(), defaults);
            })?;

            info!("Created the default profile for GPU {uuid}");
        }

        Ok(self
            .document
            .profiles
            .get(uuid)
            .cloned()
            .unwrap_or_default())
    }

    pub fn get_profile(&self, uuid: &str, name: &str) -> Option<Profile> {
        self.document
            .profiles
            .get(uuid)
            .and_then(|profiles| profiles.get(name))
            .copied()
    }

    // Add a profile with default settings
    pub fn create(&mut self, uuid: &str, name: &str) -> Result<(), ProfileError> {
        if self.get_profile(uuid, name).is_some() {
            return Err(ProfileError::DuplicateName {
                uuid: uuid.to_string(),
                name: name.to_string(),
            });
        }

        self.commit(|document| {
            document
                .profiles
                .entry(uuid.to_string())
                .or_default()
                .insert(name.to_string(), Profile::default());
        })
    }

    pub fn delete(&mut self, uuid: &str, name: &str) -> Result<(), ProfileError> {
        if self.get_profile(uuid, name).is_none() {
            return Err(ProfileError::UnknownProfile {
                uuid: uuid.to_string(),
                name: name.to_string(),
            });
        }

        self.commit(|document| {
            if let Some(profiles) = document.profiles.get_mut(uuid) {
                profiles.remove(name);
            }

            let markers = &mut document.app.apply_on_start;
            if markers.get(uuid).map(String::as_str) == Some(name) {
                markers.remove(uuid);
            }
        })
    }

    // Insert or replace the profile
    pub fn update(
        &mut self,
        uuid: &str,
        name: &str,
        profile: Profile,
    ) -> Result<(), ProfileError> {
        self.commit(|document| {
            document
                .profiles
                .entry(uuid.to_string())
                .or_default()
                .insert(name.to_string(), profile);
        })
    }

    pub fn get_apply_on_start(&self, uuid: &str) -> Option<&str> {
        self.document.app.apply_on_start.get(uuid).map(String::as_str)
    }

    // Replaces any previous marker of the GPU
    pub fn set_apply_on_start(
        &mut self,
        uuid: &str,
        name: &str,
    ) -> Result<(), ProfileError> {
        self.commit(|document| {
            document
                .app
                .apply_on_start
                .insert(uuid.to_string(), name.to_string());
        })
    }

    pub fn clear_apply_on_start(&mut self, uuid: &str) -> Result<(), ProfileError> {
        self.commit(|document| {
            document.app.apply_on_start.remove(uuid);
        })
    }

    // Disabling only clears the marker when it points at this profile
    pub fn set_apply_on_start_enabled(
        &mut self,
        uuid: &str,
        name: &str,
        enable: bool,
    ) -> Result<(), ProfileError> {
        if enable {
            self.set_apply_on_start(uuid, name)
        } else if self.get_apply_on_start(uuid) == Some(name) {
            self.clear_apply_on_start(uuid)
        } else {
            Ok(())
        }
    }

    // Apply a change to the document and write it. The previous document
    // is restored if the write fails
    fn commit(
        &mut self,
        change: impl FnOnce(&mut ProfileDocument),
    ) -> Result<(), ProfileError> {
        let previous = self.document.clone();
        change(&mut self.document);

        if let Err(err) = self.save() {
            self.document = previous;
            return Err(err);
        }

        Ok(())
    }

    fn save(&self) -> Result<(), ProfileError> {
        let json = self.document.to_json()?;

        let persistence = |source| ProfileError::Persistence {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(persistence)?;
        }

        fs::write(&self.path, json).map_err(persistence)?;

        debug!("Profiles document saved to {}", self.path.display());

        Ok(())
    }
}
