use super::text_extraction::ExtractedPage;

/// A window of page text. Chunks never span pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageChunk {
    /// 1-based page number.
    pub page: u32,
    pub heading: Option<String>,
    pub text: String,
}

/// Splits `text` into windows of at most `size` characters where consecutive windows share
/// `overlap` characters. Works on chars, so multi-byte text never splits a code point.
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let size = size.max(1);
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let mut windows = Vec::new();
    let mut start = 0_usize;

    while start < len {
        let end = len.min(start.saturating_add(size));
        windows.push(chars.get(start..end).unwrap_or_default().iter().collect());
        if end == len {
            break;
        }
        start = end.saturating_sub(overlap).max(start.saturating_add(1));
    }

    windows
}

pub fn chunk_pages(pages: &[ExtractedPage], size: usize, overlap: usize) -> Vec<PageChunk> {
    pages
        .iter()
        .enumerate()
        .filter(|(_, page)| !page.text.is_empty())
        .flat_map(|(index, page)| {
            let page_number = u32::try_from(index.saturating_add(1)).unwrap_or(u32::MAX);
            chunk_text(&page.text, size, overlap)
                .into_iter()
                .map(move |text| PageChunk {
                    page: page_number,
                    heading: page.heading.clone(),
                    text,
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Rebuilds the source by dropping each window's overlap with its predecessor.
    fn reconstruct(windows: &[String], size: usize, overlap: usize) -> String {
        let mut out = String::new();
        for (i, window) in windows.iter().enumerate() {
            if i == 0 {
                out.push_str(window);
            } else {
                let step = size.saturating_sub(overlap).max(1);
                let shared = size - step;
                out.extend(window.chars().skip(shared));
            }
        }
        out
    }

    #[test]
    fn windows_respect_size_and_overlap() {
        let text: String = (0..2_500).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let windows = chunk_text(&text, 1200, 180);

        assert!(windows.iter().all(|w| w.chars().count() <= 1200));
        for pair in windows.windows(2) {
            let tail: String = pair[0].chars().skip(1200 - 180).collect();
            let head: String = pair[1].chars().take(180).collect();
            assert_eq!(tail, head);
        }
        assert_eq!(reconstruct(&windows, 1200, 180), text);
    }

    #[test]
    fn short_text_is_one_window() {
        assert_eq!(chunk_text("Alpha Beta", 1200, 180), vec!["Alpha Beta".to_string()]);
        assert!(chunk_text("", 1200, 180).is_empty());
    }

    #[test]
    fn overlap_larger_than_size_still_advances() {
        let windows = chunk_text("abcdef", 2, 5);
        assert_eq!(windows, vec!["ab", "bc", "cd", "de", "ef"]);
    }

    #[test]
    fn multibyte_text_keeps_code_points() {
        let text = "ÆØÅ€漢字".repeat(50);
        let windows = chunk_text(&text, 7, 2);
        assert!(windows.iter().all(|w| w.chars().count() <= 7));
        assert_eq!(reconstruct(&windows, 7, 2), text);
    }

    #[test]
    fn pages_keep_their_numbers_and_skip_empty_ones() {
        let pages = vec![
            ExtractedPage {
                text: "Alpha Beta".into(),
                heading: None,
            },
            ExtractedPage {
                text: String::new(),
                heading: None,
            },
            ExtractedPage {
                text: "Gamma Delta".into(),
                heading: Some("Terms".into()),
            },
        ];
        let chunks = chunk_pages(&pages, 1200, 180);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].page, 1);
        assert_eq!(chunks[1].page, 3);
        assert_eq!(chunks[1].heading.as_deref(), Some("Terms"));
    }
}
