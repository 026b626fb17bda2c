//! ID newtypes for sessions and runs.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Browser tab identifier, supplied by the page and stable across reloads.
    TabId
);

string_id!(
    /// Page route the tab is showing, e.g. `/cs25/needs`.
    Route
);

string_id!(
    /// Identity of one rendered page instance inside a tab.
    PageInstanceId
);

string_id!(
    /// Client-generated run identifier.
    RunId
);

string_id!(
    /// Server-assigned run identifier, learned from the first lifecycle frame.
    BackendRunId
);

impl PageInstanceId {
    pub fn random() -> Self {
        Self(format!("page_{}", uuid::Uuid::new_v4()))
    }
}

impl RunId {
    /// Time-ordered so run ids sort by start order in the wire log
    pub fn random() -> Self {
        Self(format!("run_{}", uuid::Uuid::now_v7()))
    }
}

/// Logical UI-to-backend conversation: one route on one tab.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKey {
    pub route: Route,
    pub tab_id: TabId,
}

impl SessionKey {
    pub fn new(route: impl Into<Route>, tab_id: impl Into<TabId>) -> Self {
        Self {
            route: route.into(),
            tab_id: tab_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.route, self.tab_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tab_id_serialization() {
        let tab = TabId::new("tab-1");
        let json = serde_json::to_string(&tab).unwrap();
        assert_eq!(json, "\"tab-1\"");
        let back: TabId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tab);
    }

    #[test]
    fn test_run_id_random() {
        let a = RunId::random();
        let b = RunId::random();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("run_"));
    }

    #[test]
    fn test_page_instance_id_random() {
        assert!(PageInstanceId::random().as_str().starts_with("page_"));
    }

    #[test]
    fn test_session_key_display_and_serde() {
        let key = SessionKey::new("/r", "t1");
        assert_eq!(key.to_string(), "/r@t1");
        let json = serde_json::to_value(&key).unwrap();
        assert_eq!(json["route"], "/r");
        assert_eq!(json["tabId"], "t1");
    }
}
