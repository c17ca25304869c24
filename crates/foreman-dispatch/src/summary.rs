/// Cap on the text posted back to a ticket as a phase summary comment.
pub const SUMMARY_MAX_CHARS: usize = 500;

const SUMMARY_HEADINGS: &[&str] = &["summary", "overview", "key findings", "tl;dr", "tldr"];

/// Pulls a short human-facing summary out of a phase document: the text
/// under a Summary-like heading, else the first non-heading paragraph, else
/// a raw prefix of the document.
pub fn extract_summary(document: &str) -> String {
    let candidate = section_after_summary_heading(document)
        .or_else(|| first_paragraph(document))
        .unwrap_or_else(|| document.trim().to_owned());
    truncate_at_sentence(candidate.trim(), SUMMARY_MAX_CHARS)
}

fn heading_title(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with('#') {
        return None;
    }
    Some(
        trimmed
            .trim_start_matches('#')
            .trim()
            .trim_end_matches(':')
            .trim(),
    )
}

fn section_after_summary_heading(document: &str) -> Option<String> {
    let lines: Vec<&str> = document.lines().collect();
    for (index, line) in lines.iter().enumerate() {
        let Some(title) = heading_title(line) else {
            continue;
        };
        if !SUMMARY_HEADINGS.contains(&title.to_ascii_lowercase().as_str()) {
            continue;
        }
        let mut section = Vec::new();
        for following in &lines[index + 1..] {
            if heading_title(following).is_some() {
                break;
            }
            section.push(*following);
        }
        let text = section.join("\n").trim().to_owned();
        if !text.is_empty() {
            return Some(text);
        }
    }
    None
}

fn first_paragraph(document: &str) -> Option<String> {
    let mut paragraph: Vec<&str> = Vec::new();
    for line in document.lines() {
        if line.trim().is_empty() {
            if !paragraph.is_empty() {
                break;
            }
            continue;
        }
        if heading_title(line).is_some() {
            if !paragraph.is_empty() {
                break;
            }
            continue;
        }
        paragraph.push(line);
    }
    let text = paragraph.join("\n").trim().to_owned();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Truncates to `max_chars`, preferring the last sentence boundary past 40%
/// of the cap; hard-truncates with an ellipsis when no boundary qualifies.
fn truncate_at_sentence(text: &str, max_chars: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return text.to_owned();
    }

    let window = &chars[..max_chars];
    let floor = max_chars * 2 / 5;
    let mut cut = None;
    for (index, ch) in window.iter().enumerate() {
        if matches!(ch, '.' | '!' | '?') && index + 1 > floor {
            cut = Some(index + 1);
        }
    }

    match cut {
        Some(end) => window[..end].iter().collect::<String>().trim_end().to_owned(),
        None => {
            let mut truncated: String = window.iter().collect();
            truncated.truncate(truncated.trim_end().len());
            truncated.push('…');
            truncated
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_heading_section_is_extracted() {
        let document = "## Summary\nDid X and Y.\n## Details\nLong discussion.";
        assert_eq!(extract_summary(document), "Did X and Y.");
    }

    #[test]
    fn alternative_headings_are_recognized() {
        assert_eq!(
            extract_summary("# Key Findings\nThe cache is unbounded.\n# Rest\n..."),
            "The cache is unbounded."
        );
        assert_eq!(
            extract_summary("## TL;DR:\nShip it.\n## Appendix\n..."),
            "Ship it."
        );
    }

    #[test]
    fn first_paragraph_is_used_when_no_summary_heading_matches() {
        let document = "# Investigation notes\nFirst paragraph of prose.\nStill first.\n\nSecond paragraph.";
        assert_eq!(
            extract_summary(document),
            "First paragraph of prose.\nStill first."
        );
    }

    #[test]
    fn heading_only_document_falls_back_to_raw_prefix() {
        let document = "## Notes";
        assert_eq!(extract_summary(document), "## Notes");
    }

    #[test]
    fn long_text_truncates_at_the_last_sentence_boundary() {
        // One sentence ends past the 40% floor; the tail exceeds the cap.
        let body = format!(
            "{} Short tail sentence. {}",
            "a".repeat(300),
            "b".repeat(400)
        );
        let summary = extract_summary(&body);
        assert!(summary.ends_with("Short tail sentence."));
        assert!(summary.chars().count() <= SUMMARY_MAX_CHARS);
    }

    #[test]
    fn no_qualifying_boundary_hard_truncates_with_ellipsis() {
        // The only period sits before the 40% floor.
        let body = format!("Intro. {}", "c".repeat(SUMMARY_MAX_CHARS * 2));
        let summary = extract_summary(&body);
        assert!(summary.ends_with('…'));
        assert!(summary.chars().count() <= SUMMARY_MAX_CHARS + 1);
    }

    #[test]
    fn short_documents_pass_through_untouched() {
        assert_eq!(extract_summary("Small doc."), "Small doc.");
    }
}
