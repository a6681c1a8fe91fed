//! Byte-index mapping between a whitespace-normalized view of source text
//! and the original bytes.
//!
//! Regex-capable matchers run user patterns against the normalized view so
//! that patterns written with natural spacing match real source; hits are
//! then remapped to original byte spans before any rewrite is planned.

/// Normalized text plus the index maps in both directions.
///
/// Normalization trims leading/trailing Unicode whitespace, collapses each
/// internal whitespace run to a single ASCII space, and replaces each
/// contiguous invalid UTF-8 run with one U+FFFD.
#[derive(Debug, Clone)]
pub struct ByteMap {
    normalized: String,
    /// Original byte index that produced each normalized byte. For a
    /// collapsed whitespace run this points at the run's first byte.
    n2o: Vec<usize>,
    /// Normalized byte index for each original byte, -1 when the byte was
    /// collapsed or trimmed away.
    o2n: Vec<i64>,
}

/// One decoded unit of the original input.
enum Token {
    Valid { ch: char, start: usize, len: usize },
    Invalid { start: usize, len: usize },
}

impl Token {
    fn is_whitespace(&self) -> bool {
        match self {
            Token::Valid { ch, .. } => ch.is_whitespace(),
            Token::Invalid { .. } => false,
        }
    }
}

fn tokenize(input: &[u8]) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut rest = input;
    let mut offset = 0;

    while !rest.is_empty() {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                for (i, ch) in valid.char_indices() {
                    tokens.push(Token::Valid {
                        ch,
                        start: offset + i,
                        len: ch.len_utf8(),
                    });
                }
                break;
            }
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                // Safe: from_utf8 vouched for this prefix.
                let valid = unsafe { std::str::from_utf8_unchecked(&rest[..valid_up_to]) };
                for (i, ch) in valid.char_indices() {
                    tokens.push(Token::Valid {
                        ch,
                        start: offset + i,
                        len: ch.len_utf8(),
                    });
                }
                let bad_len = err.error_len().unwrap_or(rest.len() - valid_up_to);
                // Merge adjacent invalid sequences into one run.
                match tokens.last_mut() {
                    Some(Token::Invalid { start, len })
                        if *start + *len == offset + valid_up_to =>
                    {
                        *len += bad_len;
                    }
                    _ => tokens.push(Token::Invalid {
                        start: offset + valid_up_to,
                        len: bad_len,
                    }),
                }
                offset += valid_up_to + bad_len;
                rest = &rest[valid_up_to + bad_len..];
            }
        }
    }

    tokens
}

impl ByteMap {
    /// Builds the normalized view and both index maps for `input`.
    pub fn build(input: &[u8]) -> Self {
        let tokens = tokenize(input);

        let first = tokens.iter().position(|t| !t.is_whitespace());
        let last = tokens.iter().rposition(|t| !t.is_whitespace());

        let mut normalized = String::new();
        let mut n2o = Vec::new();
        let mut o2n = vec![-1i64; input.len()];

        let (Some(first), Some(last)) = (first, last) else {
            return Self {
                normalized,
                n2o,
                o2n,
            };
        };

        let mut ws_run_start: Option<usize> = None;
        for token in &tokens[first..=last] {
            if token.is_whitespace() {
                let Token::Valid { start, .. } = token else {
                    unreachable!("invalid runs are never whitespace");
                };
                if ws_run_start.is_none() {
                    ws_run_start = Some(*start);
                }
                continue;
            }

            if let Some(run_start) = ws_run_start.take() {
                o2n[run_start] = normalized.len() as i64;
                n2o.push(run_start);
                normalized.push(' ');
            }

            match token {
                Token::Valid { ch, start, len } => {
                    let n_pos = normalized.len();
                    normalized.push(*ch);
                    for i in 0..*len {
                        n2o.push(start + i);
                        o2n[start + i] = (n_pos + i) as i64;
                    }
                }
                Token::Invalid { start, len } => {
                    let n_pos = normalized.len();
                    normalized.push('\u{FFFD}');
                    for _ in 0..'\u{FFFD}'.len_utf8() {
                        n2o.push(*start);
                    }
                    for i in 0..*len {
                        o2n[start + i] = n_pos as i64;
                    }
                }
            }
        }

        Self {
            normalized,
            n2o,
            o2n,
        }
    }

    /// The whitespace-normalized text.
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// Original byte index for a normalized byte index.
    pub fn to_original(&self, normalized_byte: usize) -> Option<usize> {
        self.n2o.get(normalized_byte).copied()
    }

    /// Normalized byte index for an original byte, if it survived
    /// normalization.
    pub fn to_normalized(&self, original_byte: usize) -> Option<usize> {
        match self.o2n.get(original_byte) {
            Some(&idx) if idx >= 0 => Some(idx as usize),
            _ => None,
        }
    }

    /// Converts a normalized-space span to an original-space span by
    /// walking right from the start and left from the end until mapped
    /// bytes are found. Returns `None` when no mapping exists.
    pub fn remap_span(&self, start_n: usize, end_n: usize) -> Option<(usize, usize)> {
        if self.n2o.is_empty() || start_n >= self.n2o.len() {
            return None;
        }
        let end_n = end_n.min(self.n2o.len());
        let start_o = self.n2o[start_n];
        if end_n <= start_n {
            return Some((start_o, start_o));
        }
        let end_o = self.n2o[end_n - 1] + 1;
        Some((start_o, end_o.max(start_o)))
    }

    /// Remaps a batch of normalized spans, dropping spans with no mapping.
    pub fn remap_matches(&self, matches: &[(usize, usize)]) -> Vec<Option<(usize, usize)>> {
        matches
            .iter()
            .map(|&(start, end)| self.remap_span(start, end))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collapses_internal_whitespace() {
        let map = ByteMap::build(b"fn   main( )  {}");
        assert_eq!(map.normalized(), "fn main( ) {}");
    }

    #[test]
    fn test_trims_leading_and_trailing() {
        let map = ByteMap::build(b"  \t hello \n");
        assert_eq!(map.normalized(), "hello");
        // Trimmed bytes have no normalized position.
        assert_eq!(map.to_normalized(0), None);
        assert_eq!(map.to_normalized(10), None);
    }

    #[test]
    fn test_empty_and_all_whitespace() {
        assert_eq!(ByteMap::build(b"").normalized(), "");
        let map = ByteMap::build(b" \t\n ");
        assert_eq!(map.normalized(), "");
        assert_eq!(map.remap_span(0, 0), None);
    }

    #[test]
    fn test_collapsed_run_maps_to_first_byte() {
        let source = b"a   b";
        let map = ByteMap::build(source);
        assert_eq!(map.normalized(), "a b");
        // The single space points at the first whitespace byte.
        assert_eq!(map.to_original(1), Some(1));
        // Later run bytes were collapsed.
        assert_eq!(map.to_normalized(2), None);
        assert_eq!(map.to_normalized(3), None);
        assert_eq!(map.to_normalized(4), Some(2));
    }

    #[test]
    fn test_invalid_run_becomes_single_replacement() {
        let mut input = b"ok".to_vec();
        input.extend_from_slice(&[0xFF, 0xFE, 0xFF]);
        input.extend_from_slice(b"end");
        let map = ByteMap::build(&input);
        assert_eq!(map.normalized(), "ok\u{FFFD}end");
    }

    #[test]
    fn test_remap_span_round_trip() {
        let source = b"func  GetUser( id  int )";
        let map = ByteMap::build(source);
        assert_eq!(map.normalized(), "func GetUser( id int )");

        // "GetUser" in normalized space.
        let start_n = map.normalized().find("GetUser").unwrap();
        let (start_o, end_o) = map.remap_span(start_n, start_n + "GetUser".len()).unwrap();
        assert_eq!(&source[start_o..end_o], b"GetUser");
    }

    #[test]
    fn test_remap_multibyte() {
        let source = "let  π = 3".as_bytes();
        let map = ByteMap::build(source);
        let start_n = map.normalized().find('π').unwrap();
        let (start_o, end_o) = map.remap_span(start_n, start_n + 'π'.len_utf8()).unwrap();
        assert_eq!(&source[start_o..end_o], "π".as_bytes());
    }

    #[test]
    fn test_remap_out_of_bounds() {
        let map = ByteMap::build(b"abc");
        assert_eq!(map.remap_span(10, 12), None);
        assert_eq!(map.remap_span(1, 1), Some((1, 1)));
    }

    #[test]
    fn test_remap_matches_batch() {
        let map = ByteMap::build(b"a  b  c");
        let remapped = map.remap_matches(&[(0, 1), (2, 3), (40, 41)]);
        assert_eq!(remapped[0], Some((0, 1)));
        assert_eq!(remapped[1], Some((3, 4)));
        assert_eq!(remapped[2], None);
    }
}
