//! Bit-exact Redis key builders (§4.B), scoped by a configured prefix.

/// Builds the bit-exact keys for a room, rooted at a configurable prefix so
/// multiple deployments can share a single Redis database.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    prefix: String,
}

impl KeyBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn playback(&self, room_id: &str) -> String {
        format!("{}room:{}:playback", self.prefix, room_id)
    }

    pub fn participants(&self, room_id: &str) -> String {
        format!("{}room:{}:participants", self.prefix, room_id)
    }

    pub fn online(&self, room_id: &str) -> String {
        format!("{}room:{}:online", self.prefix, room_id)
    }

    pub fn sequence(&self, room_id: &str) -> String {
        format!("{}room:{}:sequence", self.prefix, room_id)
    }

    pub fn ratelimit(&self, room_id: &str, participant_handle: &str) -> String {
        format!("{}room:{}:ratelimit:{}", self.prefix, room_id, participant_handle)
    }

    pub fn chat_ratelimit(&self, room_id: &str, participant_handle: &str) -> String {
        format!("{}room:{}:chat_ratelimit:{}", self.prefix, room_id, participant_handle)
    }

    pub fn voice_participants(&self, room_id: &str) -> String {
        format!("{}room:{}:voice:participants", self.prefix, room_id)
    }

    pub fn mute(&self, room_id: &str, user_id: &str) -> String {
        format!("{}room:{}:mute:{}", self.prefix, room_id, user_id)
    }

    pub fn shadow_muted(&self, room_id: &str) -> String {
        format!("{}room:{}:shadow_muted", self.prefix, room_id)
    }

    pub fn events_channel(&self, room_id: &str) -> String {
        format!("{}room:{}:events", self.prefix, room_id)
    }
}

impl Default for KeyBuilder {
    fn default() -> Self {
        Self::new("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_bit_exact_with_empty_prefix() {
        let kb = KeyBuilder::default();
        assert_eq!(kb.playback("R1"), "room:R1:playback");
        assert_eq!(kb.participants("R1"), "room:R1:participants");
        assert_eq!(kb.online("R1"), "room:R1:online");
        assert_eq!(kb.sequence("R1"), "room:R1:sequence");
        assert_eq!(kb.ratelimit("R1", "abc123defg"), "room:R1:ratelimit:abc123defg");
        assert_eq!(kb.chat_ratelimit("R1", "abc123defg"), "room:R1:chat_ratelimit:abc123defg");
        assert_eq!(kb.voice_participants("R1"), "room:R1:voice:participants");
        assert_eq!(kb.mute("R1", "u1"), "room:R1:mute:u1");
        assert_eq!(kb.shadow_muted("R1"), "room:R1:shadow_muted");
        assert_eq!(kb.events_channel("R1"), "room:R1:events");
    }

    #[test]
    fn configured_prefix_is_prepended() {
        let kb = KeyBuilder::new("staging:");
        assert_eq!(kb.playback("R1"), "staging:room:R1:playback");
        assert_eq!(kb.chat_ratelimit("R1", "abc123defg"), "staging:room:R1:chat_ratelimit:abc123defg");
    }
}
