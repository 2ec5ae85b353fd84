use serde::{Deserialize, Serialize};

/// API group/version the watched kinds are served under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiRoot {
    /// Empty for the core group.
    pub group: String,
    pub version: String,
}

impl ApiRoot {
    pub fn new(group: impl Into<String>, version: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into() }
    }

    pub fn root(&self) -> String {
        if self.group.is_empty() {
            format!("/api/{}", self.version)
        } else {
            format!("/apis/{}/{}", self.group, self.version)
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn collection(&self, resource: &str) -> String {
        format!("{}/{}", self.root(), resource)
    }

    pub fn list(&self, resource: &str, limit: u32, continue_token: Option<&str>) -> String {
        let mut path = format!("{}?limit={}", self.collection(resource), limit);
        if let Some(token) = continue_token.filter(|t| !t.is_empty()) {
            path.push_str("&continue=");
            path.push_str(&encode_query_value(token));
        }
        path
    }

    pub fn watch(&self, resource: &str, resource_version: &str) -> String {
        let mut path = format!("{}?watch=1", self.collection(resource));
        if !resource_version.is_empty() {
            path.push_str("&resourceVersion=");
            path.push_str(&encode_query_value(resource_version));
        }
        path
    }
}

// Continue tokens are base64 and may carry '+', '/' and '='.
fn encode_query_value(v: &str) -> String {
    let mut out = String::with_capacity(v.len());
    for b in v.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
