use thiserror::Error;

/// All failures surfaced by the engine.
///
/// I/O and corruption errors are fatal to the current operation and are
/// never swallowed. Precondition violations indicate a programming error
/// by the caller (or by us).
#[derive(Error, Debug)]
pub enum KvError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("corruption: {0}")]
    Corruption(String),

    /// Commit-time compare-and-set validation failed. The byte fields hold
    /// the encoded key and values as they went through the codec.
    #[error(
        "compare-and-set failed on key {}: expected {}, actual {}",
        hex(.key),
        opt_hex(.expected),
        opt_hex(.actual)
    )]
    CompareAndSetFailure {
        key: Vec<u8>,
        expected: Option<Vec<u8>>,
        actual: Option<Vec<u8>>,
    },

    /// Propagated from a key/value codec adapter. Treated like an I/O
    /// failure for propagation purposes.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl KvError {
    pub fn precondition(msg: impl Into<String>) -> Self {
        KvError::Precondition(msg.into())
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        KvError::Corruption(msg.into())
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2 + 2);
    s.push_str("0x");
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

fn opt_hex(bytes: &Option<Vec<u8>>) -> String {
    match bytes {
        Some(b) => hex(b),
        None => "<absent>".to_string(),
    }
}
