use std::fmt;
use std::str::FromStr;

use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize};

/// The three participant kinds capable of exchanging messages.
///
/// Role does not scope the numeric id: an admin, a staff member and a gym
/// member may all carry the same id in their respective registries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ActorRole {
    Admin,
    Staff,
    Member,
}

impl ActorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorRole::Admin => "Admin",
            ActorRole::Staff => "Staff",
            ActorRole::Member => "Member",
        }
    }
}

impl fmt::Display for ActorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActorRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(ActorRole::Admin),
            "staff" => Ok(ActorRole::Staff),
            "member" => Ok(ActorRole::Member),
            other => Err(format!("unknown actor role '{other}'")),
        }
    }
}

impl<'de> Deserialize<'de> for ActorRole {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        ActorRole::from_str(&value).map_err(D::Error::custom)
    }
}

/// Client-resolved identity triple.
///
/// Produced entirely on the sending side from a locally held profile and
/// accepted by the server without verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorRef {
    pub id: i64,
    pub display_name: String,
    pub role: ActorRole,
}
