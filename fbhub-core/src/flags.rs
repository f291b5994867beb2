use bitflags::bitflags;

bitflags! {
    /// Per-message header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageFlags: u32 {
        /// The sender wants an answer even for kinds that are normally silent.
        const EXPECTS_REPLY = 0x1;
        /// This message answers an earlier request with the same sequence.
        const REPLY = 0x2;
        /// Unsolicited event pushed to a registered remote client.
        const NOTIFICATION = 0x4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_bits_are_truncated() {
        let flags = MessageFlags::from_bits_truncate(0xF0 | 0x1);
        assert_eq!(flags, MessageFlags::EXPECTS_REPLY);
    }
}
