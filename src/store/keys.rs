//! Store key builder
//!
//! Every key the relational state store touches is derived here from the
//! configured set names and prefixes.

use crate::config::KeysConfig;

/// Builds the keys of the connection/user/stream mapping families
#[derive(Debug, Clone)]
pub struct KeyLayout {
    names: KeysConfig,
}

impl KeyLayout {
    pub fn new(names: KeysConfig) -> Self {
        Self { names }
    }

    /// Global set of all known connection ids
    pub fn connection_ids(&self) -> &str {
        &self.names.connection_ids_set
    }

    /// Global set of all identified user ids
    pub fn user_ids(&self) -> &str {
        &self.names.user_ids_set
    }

    /// Global set of all streams with at least one subscriber
    pub fn streams(&self) -> &str {
        &self.names.streams_set
    }

    /// Integer count of guest-identified connections
    pub fn guest_connections(&self) -> &str {
        &self.names.guest_connections_key
    }

    /// Set: connection ids of a user
    pub fn user_connections(&self, user_id: &str) -> String {
        format!("{}{}", self.names.user_id_to_connection_ids_prefix, user_id)
    }

    /// Set: streams a user has joined
    pub fn user_streams(&self, user_id: &str) -> String {
        format!("{}{}", self.names.user_id_to_streams_prefix, user_id)
    }

    /// String: user id of a connection
    pub fn connection_user(&self, connection_id: &str) -> String {
        format!("{}{}", self.names.connection_id_to_user_id_prefix, connection_id)
    }

    /// Set: streams a connection is subscribed to
    pub fn connection_streams(&self, connection_id: &str) -> String {
        format!("{}{}", self.names.connection_id_to_streams_prefix, connection_id)
    }

    /// Hash: arbitrary fields of a connection
    pub fn connection_data(&self, connection_id: &str) -> String {
        format!("{}{}", self.names.connection_id_to_data_prefix, connection_id)
    }

    /// Set: connection ids subscribed to a stream
    pub fn stream_connections(&self, stream: &str) -> String {
        format!("{}{}", self.names.stream_to_connection_ids_prefix, stream)
    }

    /// Set: user ids that joined a stream
    pub fn stream_users(&self, stream: &str) -> String {
        format!("{}{}", self.names.stream_to_user_ids_prefix, stream)
    }

    /// Hash: per-user connection counters of a stream
    pub fn stream_user_counters(&self, stream: &str) -> String {
        format!(
            "{}{}",
            self.names.stream_to_user_id_connection_counter_prefix, stream
        )
    }

    /// Field of [`Self::stream_user_counters`] holding one user's count
    pub fn user_counter_field(user_id: &str) -> String {
        format!("user-{user_id}")
    }
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self::new(KeysConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_keys() {
        let keys = KeyLayout::default();

        assert_eq!(keys.connection_streams("c1"), "meta-conn-streams-c1");
        assert_eq!(keys.stream_connections("news"), "meta-stream-conns-news");
        assert_eq!(keys.stream_user_counters("news"), "meta-stream-user-counter-news");
        assert_eq!(KeyLayout::user_counter_field("7"), "user-7");
    }

    #[test]
    fn test_custom_names_flow_through() {
        let keys = KeyLayout::new(KeysConfig {
            user_id_to_streams_prefix: "u2s:".to_string(),
            streams_set: "all-streams".to_string(),
            ..KeysConfig::default()
        });

        assert_eq!(keys.user_streams("7"), "u2s:7");
        assert_eq!(keys.streams(), "all-streams");
    }
}
