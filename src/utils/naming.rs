//! Naming helpers for provisioned infrastructure.

use sha2::{Digest, Sha256};

/// Maximum length of a broker topic name (255 filename limit minus partition suffix).
pub const TOPIC_NAME_LIMIT: usize = 249;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharClass {
    Lower,
    Upper,
    Digit,
    Other,
}

fn classify(c: char) -> CharClass {
    if c.is_lowercase() {
        CharClass::Lower
    } else if c.is_uppercase() {
        CharClass::Upper
    } else if c.is_numeric() {
        CharClass::Digit
    } else {
        CharClass::Other
    }
}

/// Split an identifier into words at case, digit, and separator boundaries.
///
/// `PDFLoader` splits into `PDF` and `Loader`; separators form their own runs.
fn split_words(input: &str) -> Vec<(CharClass, String)> {
    let mut runs: Vec<(CharClass, String)> = Vec::new();
    for c in input.chars() {
        let class = classify(c);
        match runs.last_mut() {
            Some((last, run)) if *last == class => run.push(c),
            _ => runs.push((class, c.to_string())),
        }
    }

    let mut words: Vec<(CharClass, String)> = Vec::with_capacity(runs.len());
    for (class, run) in runs {
        if class == CharClass::Lower {
            if let Some((CharClass::Upper, upper)) = words.last_mut() {
                // The final capital starts the lowercase word.
                let mut word: String = upper.pop().into_iter().collect();
                word.push_str(&run);
                if upper.is_empty() {
                    words.pop();
                }
                words.push((CharClass::Lower, word));
                continue;
            }
        }
        words.push((class, run));
    }
    words
}

/// Convert an identifier to lower_snake_case.
pub fn to_lower_snake(input: &str) -> String {
    split_words(input)
        .into_iter()
        .filter(|(class, _)| *class != CharClass::Other)
        .map(|(_, word)| word.to_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}

/// Name of the development database backing `module`'s database decl `id`.
pub fn database_name(module: &str, id: &str) -> String {
    format!("{}_{}", to_lower_snake(module), to_lower_snake(id))
}

/// Broker topic name for `module`'s topic decl `id`.
pub fn topic_id(module: &str, id: &str) -> String {
    shorten(&format!("{}.{}", module, id), TOPIC_NAME_LIMIT)
}

/// Truncate `input` to `max_len` bytes, appending a sha256 hex digest for uniqueness.
pub fn shorten(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let digest = hex::encode(Sha256::digest(input.as_bytes()));
    let keep = max_len.saturating_sub(digest.len() + 1);
    if keep == 0 {
        return digest.chars().take(max_len).collect();
    }
    let mut end = keep;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}-{}", &input[..end], digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_lower_snake() {
        let cases = [
            ("lowercase", "lowercase"),
            ("Class", "class"),
            ("MyClass", "my_class"),
            ("MyC", "my_c"),
            ("HTML", "html"),
            ("PDFLoader", "pdf_loader"),
            ("AString", "a_string"),
            ("SimpleXMLParser", "simple_xml_parser"),
            ("vimRPCPlugin", "vim_rpc_plugin"),
            ("GL11Version", "gl_11_version"),
            ("99Bottles", "99_bottles"),
            ("May5", "may_5"),
            ("BFG9000", "bfg_9000"),
            ("BöseÜberraschung", "böse_überraschung"),
            ("snake_case", "snake_case"),
        ];
        for (input, expected) in cases {
            assert_eq!(to_lower_snake(input), expected, "input {input}");
        }
    }

    #[test]
    fn test_database_name() {
        assert_eq!(database_name("orderService", "MainDB"), "order_service_main_db");
    }

    #[test]
    fn test_topic_id_short_is_unchanged() {
        assert_eq!(topic_id("orders", "created"), "orders.created");
    }

    #[test]
    fn test_shorten_long_names_keeps_limit_and_uniqueness() {
        let a = "a".repeat(300);
        let b = format!("{}b", "a".repeat(299));

        let short_a = shorten(&a, TOPIC_NAME_LIMIT);
        let short_b = shorten(&b, TOPIC_NAME_LIMIT);

        assert_eq!(short_a.len(), TOPIC_NAME_LIMIT);
        assert_eq!(short_b.len(), TOPIC_NAME_LIMIT);
        assert_ne!(short_a, short_b);
    }

    #[test]
    fn test_shorten_tiny_limit_uses_digest_prefix() {
        let out = shorten("abcdefghij", 8);
        assert_eq!(out.len(), 8);
        assert!(out.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
