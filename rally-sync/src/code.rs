//! Short, human-typable session codes.
//!
//! Three letters (no `I` or `O`, which read as digits) followed by two
//! digits, e.g. `KXR07`. Meant for reading a code aloud across a gym, not for
//! collision or guess resistance.

use rand::Rng;

/// Letters allowed in a session code.
pub const CODE_LETTERS: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";

/// Generate a session code with the thread-local RNG.
pub fn generate_code() -> String {
    generate_code_with(&mut rand::thread_rng())
}

/// Generate a session code from the given RNG.
pub fn generate_code_with<R: Rng + ?Sized>(rng: &mut R) -> String {
    let mut code = String::with_capacity(5);
    for _ in 0..3 {
        let idx = rng.gen_range(0..CODE_LETTERS.len());
        code.push(CODE_LETTERS[idx] as char);
    }
    let digits: u32 = rng.gen_range(0..100);
    code.push_str(&format!("{digits:02}"));
    code
}

/// Whether `code` has the shape produced by [`generate_code`].
pub fn is_valid_code(code: &str) -> bool {
    let bytes = code.as_bytes();
    bytes.len() == 5
        && bytes[..3].iter().all(|b| CODE_LETTERS.contains(b))
        && bytes[3..].iter().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_code_shape() {
        for _ in 0..500 {
            let code = generate_code();
            assert!(is_valid_code(&code), "bad code {code}");
        }
    }

    #[test]
    fn test_no_ambiguous_letters() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let code = generate_code_with(&mut rng);
            assert!(!code.contains('I'));
            assert!(!code.contains('O'));
        }
    }

    #[test]
    fn test_seeded_is_deterministic() {
        let a = generate_code_with(&mut StdRng::seed_from_u64(42));
        let b = generate_code_with(&mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn test_validator_rejects() {
        assert!(is_valid_code("ABC12"));
        assert!(!is_valid_code("ABI12"));
        assert!(!is_valid_code("AB123"));
        assert!(!is_valid_code("ABC1"));
        assert!(!is_valid_code("abc12"));
    }
}
