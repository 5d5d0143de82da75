//! Security module for sealed-llm.
//!
//! Request payloads are sealed on the client and opened only inside the
//! worker process. The key is pre-shared out-of-band and read-only at runtime.

pub mod codec;

pub use codec::{
    Codec, DecryptionError, DecryptionFailure, EncryptedBlob, EncryptionError, Key, KeyError,
    KEY_SIZE,
};
