//! SHA-1/Base32 digests in the form web archive CDX indexes use.

use data_encoding::BASE32;
use sha1::{Digest, Sha1};

/// Compute the SHA-1 hash of a byte slice and encode it as a 32-character
/// Base32 string, the representation CDX `digest` fields use.
pub fn compute_digest(input: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(input);
    BASE32.encode(&sha1.finalize())
}

pub fn is_valid_digest(input: &str) -> bool {
    input.len() == 32
        && input
            .chars()
            .all(|c| ('2'..='7').contains(&c) || c.is_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    #[test]
    fn digest_shape() {
        let digest = super::compute_digest(b"hello, warc");
        assert_eq!(digest.len(), 32);
        assert!(super::is_valid_digest(&digest));
    }

    #[test]
    fn known_value() {
        // sha1("") = da39a3ee5e6b4b0d3255bfef95601890afd80709
        assert_eq!(
            super::compute_digest(b""),
            "3I42H3S6NNFQ2MSVX7XZKYAYSCX5QBYJ"
        );
    }
}
