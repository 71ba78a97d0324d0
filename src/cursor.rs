//! Opaque keyset cursors for `allowed_resources`.
//! A cursor carries the last returned `(parent, child)` and is pinned to the action,
//! parent filter and actor it was minted for.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{PermError, PermResult};
use crate::resource::Resource;

const CURSOR_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    v: u8,
    pub action: String,
    #[serde(default)]
    pub parent: Option<String>,
    /// Fingerprint of the actor the page was computed for.
    pub actor: u64,
    pub last: Resource,
}

impl Cursor {
    pub fn new(action: &str, parent: Option<&str>, actor: u64, last: Resource) -> Self {
        Self { v: CURSOR_VERSION, action: action.to_string(), parent: parent.map(str::to_string), actor, last }
    }

    pub fn encode(&self) -> PermResult<String> {
        let json = serde_json::to_vec(self).map_err(|e| PermError::Internal(format!("encode cursor: {}", e)))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(token: &str) -> PermResult<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|e| PermError::InvalidCursor(format!("not base64url: {}", e)))?;
        let cursor: Cursor =
            serde_json::from_slice(&bytes).map_err(|e| PermError::InvalidCursor(format!("malformed: {}", e)))?;
        if cursor.v != CURSOR_VERSION {
            return Err(PermError::InvalidCursor(format!("unsupported version {}", cursor.v)));
        }
        Ok(cursor)
    }

    /// Decode and check the cursor belongs to this listing.
    pub fn resume(token: &str, action: &str, parent: Option<&str>, actor: u64) -> PermResult<Resource> {
        let c = Self::decode(token)?;
        if c.action != action {
            return Err(PermError::InvalidCursor(format!("minted for action '{}'", c.action)));
        }
        if c.parent.as_deref() != parent {
            return Err(PermError::InvalidCursor("minted for a different parent filter".into()));
        }
        if c.actor != actor {
            return Err(PermError::InvalidCursor("minted for a different actor".into()));
        }
        Ok(c.last)
    }
}
