//! Key layout inside the shared store.
//!
//! Every key lives under one configurable prefix so several fleets can
//! share an etcd cluster:
//!
//! ```text
//! {prefix}leader          LeaderRecord (lease-bound)
//! {prefix}request         UpdateRequest
//! {prefix}status/{node}   NodeStatus
//! {prefix}nodes/{node}    NodeRegistration
//! {prefix}current         installed fleet version
//! ```

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "/fleetup/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl KeySpace {
    /// Build a key space; a trailing `/` is added when missing.
    pub fn new(prefix: &str) -> Self {
        let mut prefix = prefix.to_string();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn leader(&self) -> String {
        format!("{}leader", self.prefix)
    }

    pub fn request(&self) -> String {
        format!("{}request", self.prefix)
    }

    pub fn current(&self) -> String {
        format!("{}current", self.prefix)
    }

    pub fn status_prefix(&self) -> String {
        format!("{}status/", self.prefix)
    }

    pub fn status(&self, node: &str) -> String {
        format!("{}status/{node}", self.prefix)
    }

    pub fn nodes_prefix(&self) -> String {
        format!("{}nodes/", self.prefix)
    }

    pub fn node(&self, node: &str) -> String {
        format!("{}nodes/{node}", self.prefix)
    }

    /// Extract the node id from a `status/` key.
    pub fn node_of_status<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str())?.strip_prefix("status/")
    }

    /// Extract the node id from a `nodes/` key.
    pub fn node_of_registration<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str())?.strip_prefix("nodes/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_gets_trailing_slash() {
        let keys = KeySpace::new("/neco");
        assert_eq!(keys.request(), "/neco/request");
        assert_eq!(keys.status("boot-0"), "/neco/status/boot-0");
    }

    #[test]
    fn node_extraction() {
        let keys = KeySpace::default();
        assert_eq!(keys.node_of_status("/fleetup/status/n2"), Some("n2"));
        assert_eq!(keys.node_of_status("/fleetup/nodes/n2"), None);
        assert_eq!(keys.node_of_registration("/fleetup/nodes/n2"), Some("n2"));
        assert_eq!(keys.node_of_registration("/other/nodes/n2"), None);
    }
}
