// tests/tokenizer_tests.rs
//
// Property tests for the bounded tokenizer

use io_replay::constants::{MAX_LINE_LEN, MAX_TOKENS};
use io_replay::status::FormatError;
use io_replay::tokenizer::Tokenizer;
use proptest::prelude::*;

fn is_ignorable(line: &str) -> bool {
    line.is_empty() || line.starts_with('#') || line.bytes().all(|b| b.is_ascii_whitespace())
}

proptest! {
    #[test]
    fn round_trip_within_limits(tokens in prop::collection::vec("[a-zA-Z0-9/_. #-]{0,40}", 1..=MAX_TOKENS)) {
        let line = tokens.join(",");
        prop_assume!(line.len() <= MAX_LINE_LEN);
        prop_assume!(!is_ignorable(&line));

        let set = Tokenizer::default().tokenize_str(&line).unwrap().unwrap();
        prop_assert_eq!(set.len(), tokens.len());
        prop_assert_eq!(set.as_slice().to_vec(), tokens.iter().map(String::as_str).collect::<Vec<_>>());
        prop_assert_eq!(set.join(), line);
    }

    #[test]
    fn overlong_lines_always_rejected(extra in 1usize..2048, fill in "[a-z,]{1}") {
        let line = fill.repeat(MAX_LINE_LEN + extra);
        let err = Tokenizer::default().tokenize_str(&line).unwrap_err();
        prop_assert_eq!(err, FormatError::LineTooLong { len: MAX_LINE_LEN + extra, max: MAX_LINE_LEN });
    }

    #[test]
    fn too_many_tokens_always_rejected(tokens in prop::collection::vec("[a-z]{1,8}", (MAX_TOKENS + 1)..40)) {
        let line = tokens.join(",");
        let err = Tokenizer::default().tokenize_str(&line).unwrap_err();
        prop_assert_eq!(err, FormatError::TooManyTokens { max: MAX_TOKENS });
    }
}

#[test]
fn test_exact_limits_accepted() {
    let mut fields = vec!["x".to_string(); MAX_TOKENS];
    let used = fields.iter().map(String::len).sum::<usize>() + MAX_TOKENS - 1;
    fields[1] = "y".repeat(1 + MAX_LINE_LEN - used);
    let line = fields.join(",");
    assert_eq!(line.len(), MAX_LINE_LEN);

    let set = Tokenizer::default().tokenize_str(&line).unwrap().unwrap();
    assert_eq!(set.len(), MAX_TOKENS);
}
