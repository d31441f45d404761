use serde::{Deserialize, Deserializer, Serialize};
use std::{
    ffi::OsString,
    fmt, fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

use crate::error::Result;

/// Person attributes used by the calorie model, plus opaque account data
///
/// Missing keys and explicit `null`s both fall back to the default profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredProfile")]
pub struct Profile {
    /// Account id, accepted as a JSON string or number
    pub id: Option<String>,
    /// Sex used by the resting metabolism formula
    pub male: bool,
    /// Age in years
    pub age: f64,
    /// Body weight in kilograms
    pub weight: f64,
    /// Height in meters
    pub height: f64,
    /// Cloud auth token
    pub token: Option<String>,
    /// Cloud device id
    pub did: Option<String>,
    /// Account e-mail
    pub email: Option<String>,
    /// Account password
    pub password: Option<String>,
    /// Lowercase hex MD5 of the account password
    pub password_md5: Option<String>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            id: None,
            male: true,
            age: 30.0,
            weight: 80.0,
            height: 1.80,
            token: None,
            did: None,
            email: None,
            password: None,
            password_md5: None,
        }
    }
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct StoredProfile {
    #[serde(deserialize_with = "deserialize_optional_id")]
    id: Option<String>,
    male: Option<bool>,
    age: Option<f64>,
    weight: Option<f64>,
    height: Option<f64>,
    token: Option<String>,
    did: Option<String>,
    email: Option<String>,
    password: Option<String>,
    password_md5: Option<String>,
}

impl From<StoredProfile> for Profile {
    fn from(stored: StoredProfile) -> Self {
        let defaults = Self::default();
        Self {
            id: stored.id,
            male: stored.male.unwrap_or(defaults.male),
            age: stored.age.unwrap_or(defaults.age),
            weight: stored.weight.unwrap_or(defaults.weight),
            height: stored.height.unwrap_or(defaults.height),
            token: stored.token,
            did: stored.did,
            email: stored.email,
            password: stored.password,
            password_md5: stored.password_md5,
        }
    }
}

impl Profile {
    /// Load a profile file; no path or an empty file gives the default
    ///
    /// # Errors
    ///
    /// Returns [`crate::PadError::Io`] if the file cannot be read, or
    /// [`crate::PadError::Json`] if it is not a JSON object.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            debug!("No profile file, using default profile");
            return Ok(Self::default());
        };

        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            debug!("Profile file {} is empty, using default", path.display());
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    /// Save to `path`, replacing it atomically
    ///
    /// The first save over an existing file keeps a `.backup` copy of it.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PadError::Io`] on any file system failure.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = with_suffix(path, ".tmp");
        let backup = with_suffix(path, ".backup");

        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        if path.exists() && !backup.exists() {
            fs::copy(path, &backup)?;
            info!("Profile backup written to {}", backup.display());
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// MD5 of the account password as lowercase hex
    ///
    /// A stored `password_md5` wins over hashing `password`.
    #[must_use]
    pub fn password_digest(&self) -> Option<String> {
        if let Some(digest) = &self.password_md5 {
            return Some(digest.clone());
        }
        self.password.as_ref().map(|password| {
            let mut hasher = md5::Context::new();
            hasher.consume(password.as_bytes());
            format!("{:x}", hasher.finalize())
        })
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Profile(pid={}, male={}, age={}, weight={}, height={})",
            self.id.as_deref().unwrap_or("None"),
            self.male,
            self.age,
            self.weight,
            self.height
        )
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Accept an id written either as a JSON string or a number
pub(crate) fn deserialize_optional_id<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(Option::<RawId>::deserialize(deserializer)?.map(|id| match id {
        RawId::Text(text) => text,
        RawId::Number(number) => number.to_string(),
    }))
}
