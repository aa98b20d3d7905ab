use anyhow::Result;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::clock;
use crate::document_store::DocumentStore;
use crate::layout::ProjectLayout;

/// Characters of README text kept in the cache.
pub const CACHE_CONTENT_CHARS: usize = 5000;

const OVERVIEW_KEYS: [&str; 5] = ["description", "overview", "about", "summary", "introduction"];
const ARCHITECTURE_KEYS: [&str; 5] = ["architecture", "structure", "design", "system", "project structure"];
const INTRO_ARCHITECTURE_KEYS: [&str; 6] = [
    "architecture",
    "structure",
    "design",
    "scheme",
    "system",
    "project structure",
];
const INTRO_PARAGRAPHS: usize = 2;
const INTRO_PARAGRAPHS_WITH_ARCHITECTURE: usize = 5;
const ARCHITECTURE_RAW_LINES: usize = 30;
const ARCHITECTURE_LINES_KEPT: usize = 3;
const MIN_MEANINGFUL_LINE: usize = 10;
const MIN_PARTIAL_FILL: usize = 50;

lazy_static! {
    static ref CODE_BLOCK: Regex = Regex::new(r"```[\s\S]*?```").unwrap();
    static ref IMAGE: Regex = Regex::new(r"!\[[^\]]*\]\([^)]*\)").unwrap();
    static ref LINK: Regex = Regex::new(r"\[([^\]]+)\]\([^)]+\)").unwrap();
    static ref SECTION_HEADING: Regex = Regex::new(r"^##+\s*(\S.*)$").unwrap();
    static ref ARCHITECTURE_HEADING: Regex =
        Regex::new(r"(?i)^#+\s*(architecture|structure|design|scheme|system|project structure)").unwrap();
    static ref HEADING_MARK: Regex = Regex::new(r"(?m)^[ \t]*#+[ \t]*").unwrap();
    static ref PARAGRAPH_BREAK: Regex = Regex::new(r"\n[ \t]*\n").unwrap();
    static ref MANY_NEWLINES: Regex = Regex::new(r"\n{3,}").unwrap();
    static ref RUN_OF_SPACES: Regex = Regex::new(r"[ \t]+").unwrap();
    static ref INLINE_CODE: Regex = Regex::new(r"`[^`]+`").unwrap();
    static ref BOX_DRAWING: Regex = Regex::new(r"^[│├└┌┐┘┴┬─\s]+$").unwrap();
}

// ── Summary ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Section {
    heading: Option<String>,
    body: String,
}

/// Budgeted summary of a README: overview first, then architecture, then
/// further paragraphs while they fit. Never longer than `max_chars`.
pub fn summarize(readme: &str, max_chars: usize) -> String {
    let raw = readme.trim().replace('\r', "");
    if raw.is_empty() || max_chars == 0 {
        return String::new();
    }
    let text = strip_markup(&raw);
    let sections = split_sections(&text);
    let raw_sections = split_sections(&raw);

    let mut overview: Option<String> = None;
    let mut architecture: Option<String> = None;

    for section in &sections {
        let Some(heading) = section.heading.as_deref() else {
            continue;
        };
        let heading_lower = heading.to_lowercase();
        let body = section.body.trim();
        if contains_any(&heading_lower, &OVERVIEW_KEYS) {
            if overview.is_none() && !body.is_empty() {
                overview = Some(body.to_string());
            }
        } else if contains_any(&heading_lower, &ARCHITECTURE_KEYS) && architecture.is_none() {
            architecture = Some(if body.is_empty() {
                architecture_from_raw(&raw_sections, heading)
            } else {
                body.to_string()
            });
        }
    }

    if overview.is_none() {
        if let Some(intro) = sections.first().filter(|s| s.heading.is_none()) {
            let paragraphs = paragraphs(&intro.body);
            let take = if contains_any(&intro.body.to_lowercase(), &INTRO_ARCHITECTURE_KEYS) {
                INTRO_PARAGRAPHS_WITH_ARCHITECTURE
            } else {
                INTRO_PARAGRAPHS
            };
            if !paragraphs.is_empty() {
                overview = Some(paragraphs.into_iter().take(take).collect::<Vec<_>>().join("\n\n"));
            }
        }
    }

    if architecture.is_none() && text.to_lowercase().contains("architecture") {
        architecture = find_architecture_anywhere(&text)
            .map(|body| take_chars(&body, max_chars / 2).to_string())
            .filter(|body| !body.is_empty());
    }

    let mut parts: Vec<String> = overview.into_iter().chain(architecture).collect();
    if parts.is_empty() {
        let all = paragraphs(&text);
        parts = if all.len() >= 2 {
            all.into_iter().take(2).collect()
        } else {
            vec![take_chars(&text, max_chars).to_string()]
        };
    }

    let mut summary = clean(&parts.join("\n\n"));
    fill(&mut summary, &text, max_chars);
    truncate_at_word(&summary, max_chars)
}

fn strip_markup(text: &str) -> String {
    let text = CODE_BLOCK.replace_all(text, "");
    let text = IMAGE.replace_all(&text, "");
    LINK.replace_all(&text, "$1").into_owned()
}

/// Split at `##`+ headings outside code fences. Text before the first heading
/// is a section without heading.
fn split_sections(text: &str) -> Vec<Section> {
    let mut sections = vec![Section {
        heading: None,
        body: String::new(),
    }];
    let mut in_fence = false;
    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        }
        if !in_fence {
            if let Some(caps) = SECTION_HEADING.captures(line) {
                sections.push(Section {
                    heading: Some(caps[1].trim().to_string()),
                    body: String::new(),
                });
                continue;
            }
        }
        if let Some(current) = sections.last_mut() {
            current.body.push_str(line);
            current.body.push('\n');
        }
    }
    if sections[0].body.trim().is_empty() && sections.len() > 1 {
        sections.remove(0);
    }
    sections
}

/// For an architecture section that is only a code block or diagram: the
/// first meaningful prose lines of the raw section, else its title.
fn architecture_from_raw(raw_sections: &[Section], heading: &str) -> String {
    let lines: Vec<String> = raw_sections
        .iter()
        .find(|s| s.heading.as_deref() == Some(heading))
        .map(|section| {
            let mut in_fence = false;
            section
                .body
                .lines()
                .take(ARCHITECTURE_RAW_LINES)
                .filter_map(|line| {
                    if line.trim_start().starts_with("```") {
                        in_fence = !in_fence;
                        return None;
                    }
                    if in_fence {
                        return None;
                    }
                    let cleaned = INLINE_CODE.replace_all(line, "").trim().to_string();
                    (cleaned.chars().count() > MIN_MEANINGFUL_LINE && !BOX_DRAWING.is_match(&cleaned))
                        .then_some(cleaned)
                })
                .take(ARCHITECTURE_LINES_KEPT)
                .collect()
        })
        .unwrap_or_default();

    if lines.is_empty() {
        format!("Architecture: {}", title_case(heading.trim_matches(|c: char| !c.is_alphanumeric() && c != ' ')))
    } else {
        lines.join(" ")
    }
}

/// Body under the first architecture-like heading of any level, up to the next heading.
fn find_architecture_anywhere(text: &str) -> Option<String> {
    let mut lines = text.lines();
    lines.find(|line| ARCHITECTURE_HEADING.is_match(line))?;
    let body: Vec<&str> = lines
        .take_while(|line| !line.trim_start().starts_with('#'))
        .collect();
    let body = body.join("\n").trim().to_string();
    (!body.is_empty()).then_some(body)
}

fn paragraphs(text: &str) -> Vec<String> {
    PARAGRAPH_BREAK
        .split(text.trim())
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn clean(text: &str) -> String {
    let text = HEADING_MARK.replace_all(text, "");
    let text = MANY_NEWLINES.replace_all(&text, "\n\n");
    RUN_OF_SPACES.replace_all(&text, " ").trim().to_string()
}

/// Greedily append paragraphs not already present while they fit; when one
/// does not fit and the summary is still short, append a prefix of it.
fn fill(summary: &mut String, text: &str, max_chars: usize) {
    let mut len = summary.chars().count();
    if len >= max_chars {
        return;
    }
    let body_paragraphs = paragraphs(text)
        .into_iter()
        .filter(|p| !p.lines().all(|l| l.trim_start().starts_with('#')))
        .map(|p| clean(&p));
    for para in body_paragraphs {
        if para.is_empty() || summary.contains(&para) {
            continue;
        }
        let para_len = para.chars().count();
        if len + para_len + 2 <= max_chars {
            summary.push_str("\n\n");
            summary.push_str(&para);
            len += para_len + 2;
            continue;
        }
        if (len as f64) < max_chars as f64 * 0.8 {
            let room = max_chars.saturating_sub(len + 2);
            if room > MIN_PARTIAL_FILL {
                summary.push_str("\n\n");
                summary.push_str(take_chars(&para, room));
            }
        }
        break;
    }
}

/// Cut to `max_chars` including the trailing `…`, at a word boundary when
/// that keeps more than 80% of the budget.
fn truncate_at_word(summary: &str, max_chars: usize) -> String {
    if summary.chars().count() <= max_chars {
        return summary.to_string();
    }
    let cut = take_chars(summary, max_chars.saturating_sub(1));
    let boundary = cut
        .rfind(' ')
        .filter(|&idx| cut[..idx].chars().count() as f64 > max_chars as f64 * 0.8);
    let kept = match boundary {
        Some(idx) => &cut[..idx],
        None => cut,
    };
    format!("{}…", kept.trim_end())
}

fn take_chars(text: &str, n: usize) -> &str {
    match text.char_indices().nth(n) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

// ── Cache ────────────────────────────────────────────────────────────────────

/// `readme_cache.json`: the head of the README and its checksum.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadmeCache {
    pub content: String,
    pub checksum: String,
    pub last_updated: Option<String>,
}

pub fn checksum(text: &str) -> String {
    format!("{:016x}", xxh3_64(text.as_bytes()))
}

/// Read the README and refresh the cache when its checksum changed.
/// `Ok(None)` when the project has no readable README.
pub fn refresh_cache(store: &DocumentStore, layout: &ProjectLayout) -> Result<Option<ReadmeCache>> {
    let Some(path) = layout.readme() else {
        return Ok(None);
    };
    let Some(text) = store.read_text(&path) else {
        return Ok(None);
    };
    let sum = checksum(&text);
    let cached = store.read(&layout.readme_cache(), ReadmeCache::default).into_value();
    if cached.checksum == sum && !cached.content.is_empty() {
        return Ok(Some(cached));
    }
    let fresh = ReadmeCache {
        content: take_chars(&text, CACHE_CONTENT_CHARS).to_string(),
        checksum: sum,
        last_updated: Some(clock::now_rfc3339()),
    };
    store.write(&layout.readme_cache(), &fresh, false)?;
    tracing::debug!(project = layout.name(), checksum = %fresh.checksum, "readme cache refreshed");
    Ok(Some(fresh))
}
