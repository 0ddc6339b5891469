use anyhow::Context;
use serde::Deserialize;

use crate::models::UserId;
use crate::permissions::BypassList;

pub const PERMISSION_BYPASS_ENV: &str = "MENU_PERMISSION_BYPASS_USERS";
pub const ROUTING_BYPASS_ENV: &str = "MENU_ROUTING_BYPASS_USERS";

/// Principals exempt from role-based resolution.
///
/// The two lists are independent: permission bypass grants the wildcard permission,
/// routing bypass shows every enabled route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AccessConfig {
    pub permission_bypass_user_ids: Vec<UserId>,
    pub routing_bypass_user_ids: Vec<UserId>,
}

impl AccessConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            permission_bypass_user_ids: read_ids(PERMISSION_BYPASS_ENV)?,
            routing_bypass_user_ids: read_ids(ROUTING_BYPASS_ENV)?,
        })
    }

    pub fn permission_bypass(&self) -> BypassList {
        BypassList::new(self.permission_bypass_user_ids.iter().copied())
    }

    pub fn routing_bypass(&self) -> BypassList {
        BypassList::new(self.routing_bypass_user_ids.iter().copied())
    }
}

fn read_ids(var: &str) -> anyhow::Result<Vec<UserId>> {
    match std::env::var(var) {
        Ok(raw) => parse_ids(&raw).with_context(|| format!("invalid {var}")),
        Err(std::env::VarError::NotPresent) => Ok(Vec::new()),
        Err(err) => Err(err).with_context(|| format!("failed to read {var}")),
    }
}

/// Comma separated user ids; blank entries are skipped.
pub fn parse_ids(raw: &str) -> anyhow::Result<Vec<UserId>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<UserId>()
                .with_context(|| format!("user id {part:?} is not an integer"))
        })
        .collect()
}
