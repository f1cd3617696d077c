//! Protocol-level constants.

/// Socket close code for a normal shutdown.
pub const CLOSE_NORMAL: u16 = 1000;

/// Socket close code for a policy violation (unknown session code,
/// malformed registration).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Number of characters in a session code.
pub const SESSION_CODE_LEN: usize = 6;

/// Characters a session code is drawn from.
pub const SESSION_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
