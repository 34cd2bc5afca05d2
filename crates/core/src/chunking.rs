use crate::models::EngineOptions;
use regex::Regex;

#[derive(Debug, Clone, PartialEq)]
pub struct SplitPiece {
    pub section: Option<String>,
    pub content: String,
}

pub fn split_fixed(text: &str, options: &EngineOptions) -> Vec<SplitPiece> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }

    let window = options.chunk_chars.max(1);
    let stride = window.saturating_sub(options.overlap_chars).max(1);

    let mut pieces = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + window).min(chars.len());
        pieces.push(SplitPiece {
            section: None,
            content: chars[start..end].iter().collect(),
        });
        if end == chars.len() {
            break;
        }
        start += stride;
    }

    pieces
}

pub fn split_markdown(text: &str, options: &EngineOptions) -> Result<Vec<SplitPiece>, regex::Error> {
    let heading_re = Regex::new(r"^#{1,6}\s+(.+)$")?;

    let mut paragraphs: Vec<(Option<String>, String)> = Vec::new();
    let mut section: Option<String> = None;
    let mut pending = String::new();

    for line in text.lines() {
        if let Some(captures) = heading_re.captures(line.trim_end()) {
            if !pending.trim().is_empty() {
                paragraphs.push((section.clone(), pending.trim().to_string()));
            }
            pending.clear();
            section = Some(captures[1].trim().to_string());
            continue;
        }

        if line.trim().is_empty() {
            if !pending.trim().is_empty() {
                paragraphs.push((section.clone(), pending.trim().to_string()));
            }
            pending.clear();
            continue;
        }

        if !pending.is_empty() {
            pending.push('\n');
        }
        pending.push_str(line);
    }
    if !pending.trim().is_empty() {
        paragraphs.push((section, pending.trim().to_string()));
    }

    let mut pieces: Vec<SplitPiece> = Vec::new();
    let mut current = String::new();
    let mut current_section: Option<String> = None;

    for (paragraph_section, paragraph) in paragraphs {
        let section_changed = paragraph_section != current_section;
        let overflows =
            !current.is_empty() && current.len() + paragraph.len() + 2 > options.chunk_chars;

        if section_changed || overflows {
            if !current.is_empty() {
                pieces.push(SplitPiece {
                    section: current_section.clone(),
                    content: std::mem::take(&mut current),
                });
            }
            current_section = paragraph_section;
        }

        if paragraph.len() > options.chunk_chars {
            if !current.is_empty() {
                pieces.push(SplitPiece {
                    section: current_section.clone(),
                    content: std::mem::take(&mut current),
                });
            }
            for mut piece in split_fixed(&paragraph, options) {
                piece.section = current_section.clone();
                pieces.push(piece);
            }
            continue;
        }

        if current.is_empty() {
            current = paragraph;
        } else {
            current.push_str("\n\n");
            current.push_str(&paragraph);
        }
    }

    if !current.is_empty() {
        pieces.push(SplitPiece {
            section: current_section,
            content: current,
        });
    }

    if pieces.is_empty() && !text.trim().is_empty() {
        pieces.push(SplitPiece {
            section: None,
            content: text.trim().to_string(),
        });
    }

    Ok(pieces)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(chunk_chars: usize, overlap_chars: usize) -> EngineOptions {
        EngineOptions {
            chunk_chars,
            overlap_chars,
            top_k: 3,
        }
    }

    #[test]
    fn short_document_yields_exactly_one_chunk() {
        let text = "a".repeat(1_000);
        let pieces = split_fixed(&text, &EngineOptions::default());
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].content.len(), 1_000);
    }

    #[test]
    fn chunk_count_follows_window_arithmetic() {
        // count = 1 + ceil((L - window) / stride) for L > window
        for (length, expected) in [(1_001, 2), (1_800, 2), (1_801, 3), (2_500, 3), (4_201, 6)] {
            let text = "x".repeat(length);
            let pieces = split_fixed(&text, &EngineOptions::default());
            assert_eq!(pieces.len(), expected, "length {length}");
        }
    }

    #[test]
    fn consecutive_chunks_overlap_by_configured_amount() {
        let text: String = ('a'..='z').cycle().take(1_800).collect();
        let pieces = split_fixed(&text, &EngineOptions::default());
        assert_eq!(pieces.len(), 2);

        let first: Vec<char> = pieces[0].content.chars().collect();
        let second: Vec<char> = pieces[1].content.chars().collect();
        assert_eq!(&first[800..], &second[..200]);
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(split_fixed("", &EngineOptions::default()).is_empty());
    }

    #[test]
    fn markdown_splits_on_heading_boundaries() {
        let text = "# Intro\n\nFirst paragraph.\n\n## Usage\n\nSecond paragraph.\nStill second.\n";
        let pieces = split_markdown(text, &options(1_000, 200)).unwrap();

        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].section.as_deref(), Some("Intro"));
        assert_eq!(pieces[0].content, "First paragraph.");
        assert_eq!(pieces[1].section.as_deref(), Some("Usage"));
        assert!(pieces[1].content.contains("Still second."));
    }

    #[test]
    fn markdown_packs_paragraphs_up_to_window() {
        let text = "para one.\n\npara two.\n\npara three.";
        let pieces = split_markdown(text, &options(1_000, 200)).unwrap();
        assert_eq!(pieces.len(), 1);
        assert!(pieces[0].content.contains("para one."));
        assert!(pieces[0].content.contains("para three."));
    }

    #[test]
    fn oversized_markdown_paragraph_falls_back_to_fixed_windows() {
        let big = "y".repeat(120);
        let text = format!("# H\n\n{big}\n");
        let pieces = split_markdown(&text, &options(50, 10)).unwrap();
        assert!(pieces.len() > 1);
        for piece in &pieces {
            assert_eq!(piece.section.as_deref(), Some("H"));
            assert!(piece.content.len() <= 50);
        }
    }
}
