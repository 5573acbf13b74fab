/// Output sanitization for streams captured from a tty-attached exec.
///
/// The raw stream can carry ANSI escape sequences and stray control
/// bytes that are terminal artifacts, not program output. This pass
/// strips them while preserving the program's actual text, including
/// numeric and structural content, then normalizes line endings and
/// trims surrounding whitespace.
pub fn sanitize_output(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            // ESC-introduced sequences: CSI (ESC [ ... final byte),
            // OSC (ESC ] ... BEL or ESC \), or a single escaped char.
            '\x1b' => match chars.peek() {
                Some('[') => {
                    chars.next();
                    for next in chars.by_ref() {
                        if ('\x40'..='\x7e').contains(&next) {
                            break;
                        }
                    }
                }
                Some(']') => {
                    chars.next();
                    while let Some(next) = chars.next() {
                        if next == '\x07' {
                            break;
                        }
                        if next == '\x1b' {
                            if chars.peek() == Some(&'\\') {
                                chars.next();
                            }
                            break;
                        }
                    }
                }
                Some(_) => {
                    chars.next();
                }
                None => {}
            },
            // Normalize \r\n and bare \r to \n.
            '\r' => {
                if chars.peek() != Some(&'\n') {
                    out.push('\n');
                }
            }
            '\n' | '\t' => out.push(c),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }

    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_output_untouched() {
        assert_eq!(sanitize_output("hello"), "hello");
        assert_eq!(sanitize_output("line1\nline2"), "line1\nline2");
        assert_eq!(sanitize_output("a\tb"), "a\tb");
    }

    #[test]
    fn test_trailing_newline_trimmed() {
        assert_eq!(sanitize_output("4\n"), "4");
        assert_eq!(sanitize_output("hello\r\n"), "hello");
        assert_eq!(sanitize_output("  hello  \n"), "hello");
    }

    #[test]
    fn test_crlf_normalized() {
        assert_eq!(sanitize_output("a\r\nb\r\nc"), "a\nb\nc");
        assert_eq!(sanitize_output("a\rb"), "a\nb");
    }

    #[test]
    fn test_ansi_color_codes_stripped() {
        assert_eq!(sanitize_output("\x1b[31mred\x1b[0m"), "red");
        assert_eq!(sanitize_output("\x1b[1;32mbold green\x1b[m"), "bold green");
    }

    #[test]
    fn test_osc_sequences_stripped() {
        assert_eq!(sanitize_output("\x1b]0;title\x07output"), "output");
        assert_eq!(sanitize_output("\x1b]8;;url\x1b\\link"), "link");
    }

    #[test]
    fn test_control_bytes_stripped() {
        assert_eq!(sanitize_output("\x00\x01hello\x7f"), "hello");
        assert_eq!(sanitize_output("\x08\x0bdata"), "data");
    }

    #[test]
    fn test_numeric_and_structural_content_preserved() {
        assert_eq!(sanitize_output("[1, 2, 3]\n"), "[1, 2, 3]");
        assert_eq!(
            sanitize_output("{\"key\": 42}\r\n"),
            "{\"key\": 42}"
        );
        assert_eq!(sanitize_output("4.0"), "4.0");
        assert_eq!(sanitize_output("-17"), "-17");
    }

    #[test]
    fn test_interior_newlines_kept() {
        assert_eq!(sanitize_output("\n1\n2\n3\n"), "1\n2\n3");
    }

    #[test]
    fn test_empty_and_whitespace_only() {
        assert_eq!(sanitize_output(""), "");
        assert_eq!(sanitize_output("   \r\n"), "");
    }
}
