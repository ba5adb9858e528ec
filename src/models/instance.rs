//! Hosted instance records, as held by the tenant directory.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Service kind of a hosted instance.
///
/// Only `hosting` instances own a content root in the object store; compute
/// instances (`vps`) and anything unrecognised have none.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum InstanceKind {
    Hosting,
    Vps,
    #[serde(other)]
    Other,
}

/// A single hosted instance (one tenant of the virtual filesystem).
///
/// Matches the shape of order records, so unrelated order fields (plan,
/// price, billing) are ignored on deserialization.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Opaque instance identifier.
    pub id: String,

    /// Service kind (`type` in order records).
    #[serde(rename = "type")]
    pub kind: InstanceKind,

    /// DNS label the instance is served under, e.g. `demo` for
    /// `demo.example.com`. Required for hosting instances.
    #[serde(default)]
    pub subdomain: Option<String>,
}

impl Instance {
    /// Key prefix owning every object of this instance, or `None` when the
    /// instance has no servable content.
    pub fn root_prefix(&self) -> Option<String> {
        match self.kind {
            InstanceKind::Hosting => {
                let subdomain = self.subdomain.as_deref()?.trim();
                if subdomain.is_empty() || !is_dns_label(subdomain) {
                    return None;
                }
                Some(format!("websites/{}/public_html/", subdomain.to_ascii_lowercase()))
            }
            InstanceKind::Vps | InstanceKind::Other => None,
        }
    }
}

/// Letters, digits and inner hyphens only; at most 63 characters.
fn is_dns_label(label: &str) -> bool {
    label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}
