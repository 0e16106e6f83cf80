use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};
use crate::session::UserType;

/// Wire and config value meaning "no daily limit"
pub const UNLIMITED: i64 = -1;

/// Daily message allowance. Serialized as a non-negative integer, or `-1` for unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum MessageLimit {
    Limited(u32),
    Unlimited,
}

impl MessageLimit {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, MessageLimit::Unlimited)
    }

    /// Messages left after `count` have been sent today; `None` when unlimited
    pub fn remaining(&self, count: u64) -> Option<u64> {
        match self {
            MessageLimit::Limited(max) => Some(u64::from(*max).saturating_sub(count)),
            MessageLimit::Unlimited => None,
        }
    }

    /// Whether one more message may be sent after `count` today
    pub fn admits(&self, count: u64) -> bool {
        match self {
            MessageLimit::Limited(max) => count < u64::from(*max),
            MessageLimit::Unlimited => true,
        }
    }

    pub fn as_wire(&self) -> i64 {
        i64::from(*self)
    }
}

impl TryFrom<i64> for MessageLimit {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if value == UNLIMITED {
            return Ok(MessageLimit::Unlimited);
        }
        u32::try_from(value).map(MessageLimit::Limited).map_err(|_| {
            format!(
                "`max_messages_per_day` must be a non-negative integer or -1 for unlimited, got {value}"
            )
        })
    }
}

impl From<MessageLimit> for i64 {
    fn from(limit: MessageLimit) -> Self {
        match limit {
            MessageLimit::Limited(max) => i64::from(max),
            MessageLimit::Unlimited => UNLIMITED,
        }
    }
}

impl fmt::Display for MessageLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageLimit::Limited(max) => write!(f, "{max}"),
            MessageLimit::Unlimited => f.write_str("unlimited"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Entitlement {
    pub max_messages_per_day: MessageLimit,
    #[serde(default = "default_model_ids")]
    pub available_model_ids: Vec<String>,
}

fn default_model_ids() -> Vec<String> {
    vec!["chat-model".to_string()]
}

fn all_model_ids() -> Vec<String> {
    vec![
        "chat-model".to_string(),
        "chat-model-reasoning".to_string(),
    ]
}

fn default_guest() -> Entitlement {
    Entitlement {
        max_messages_per_day: MessageLimit::Limited(20),
        available_model_ids: default_model_ids(),
    }
}

fn default_regular() -> Entitlement {
    Entitlement {
        max_messages_per_day: MessageLimit::Limited(100),
        available_model_ids: all_model_ids(),
    }
}

fn default_pro() -> Entitlement {
    Entitlement {
        max_messages_per_day: MessageLimit::Limited(500),
        available_model_ids: all_model_ids(),
    }
}

fn default_admin() -> Entitlement {
    Entitlement {
        max_messages_per_day: MessageLimit::Unlimited,
        available_model_ids: all_model_ids(),
    }
}

/// Per-tier entitlements. Tiers left out of the config keep their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntitlementsConfig {
    #[serde(default = "default_guest")]
    pub guest: Entitlement,
    #[serde(default = "default_regular")]
    pub regular: Entitlement,
    #[serde(default = "default_pro")]
    pub pro: Entitlement,
    #[serde(default = "default_admin")]
    pub admin: Entitlement,
}

impl Default for EntitlementsConfig {
    fn default() -> Self {
        Self {
            guest: default_guest(),
            regular: default_regular(),
            pro: default_pro(),
            admin: default_admin(),
        }
    }
}

impl EntitlementsConfig {
    pub fn get(&self, user_type: UserType) -> &Entitlement {
        match user_type {
            UserType::Guest => &self.guest,
            UserType::Regular => &self.regular,
            UserType::Pro => &self.pro,
            UserType::Admin => &self.admin,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        for user_type in [
            UserType::Guest,
            UserType::Regular,
            UserType::Pro,
            UserType::Admin,
        ] {
            if self.get(user_type).available_model_ids.is_empty() {
                return Err(Error::new(ErrorDetails::Config {
                    message: format!(
                        "`entitlements.{user_type}.available_model_ids` must not be empty"
                    ),
                }));
            }
        }
        Ok(())
    }
}
