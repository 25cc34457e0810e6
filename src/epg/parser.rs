//! Streaming XMLTV guide parser and schedule resolver
//!
//! Guide files reach 100MB+ uncompressed, so the document is pull-parsed
//! and folded into a per-channel now/next projection in one pass; whole
//! programme lists are never materialized.

use std::collections::HashMap;
use std::io::BufRead;

use chrono::{Local, NaiveDateTime, TimeZone};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use tracing::debug;

use crate::epg::matching::MatchingIndex;
use crate::models::{NowNext, Program};

/// Result of one guide resolution pass
#[derive(Debug, Clone, Default)]
pub struct GuideResult {
    /// Channel id (playlist-side) to now/next projection. Channels with no
    /// matched guide entries are absent.
    pub now_next: HashMap<String, NowNext>,
    /// XML errors tolerated during the walk (up to 20 retained)
    pub errors: Vec<String>,
    pub error_count: usize,
}

/// Parser state
#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    Root,
    Channel,
    Programme,
    Title,
    Desc,
    DisplayName,
}

/// A `<channel>` declaration being collected
struct ChannelDecl {
    id: String,
    aliases: Vec<String>,
}

/// A `<programme>` element being collected
struct ProgrammeDecl {
    channel: String,
    start: Option<i64>,
    stop: Option<i64>,
    title: String,
    description: String,
}

const MAX_RETAINED_ERRORS: usize = 20;

/// Walk the guide stream, matching each broadcast to a playlist channel
/// through `index` and folding it into that channel's now/next pair
/// relative to `eval_ts`.
///
/// Malformed elements are skipped, counted and the walk continues; only a
/// reader-level failure aborts.
pub fn resolve_guide<R: BufRead>(
    reader: R,
    index: &MatchingIndex,
    eval_ts: i64,
) -> Result<GuideResult, String> {
    let mut xml_reader = Reader::from_reader(reader);
    xml_reader.config_mut().trim_text(true);

    let mut result = GuideResult::default();
    // Guide id -> display-name aliases seen in channel declarations
    let mut aliases: HashMap<String, Vec<String>> = HashMap::new();
    let mut buf = Vec::with_capacity(8192);

    let mut state = ParserState::Root;
    let mut current_channel: Option<ChannelDecl> = None;
    let mut current_programme: Option<ProgrammeDecl> = None;
    let mut text_buf = String::new();
    let mut matched = 0usize;

    loop {
        let position = xml_reader.buffer_position();
        match xml_reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                b"channel" => {
                    state = ParserState::Channel;
                    current_channel = Some(ChannelDecl {
                        id: get_attribute(e, "id").unwrap_or_default(),
                        aliases: Vec::new(),
                    });
                }
                b"programme" => {
                    state = ParserState::Programme;
                    current_programme = Some(ProgrammeDecl {
                        channel: get_attribute(e, "channel").unwrap_or_default(),
                        start: get_attribute(e, "start").and_then(|s| parse_xmltv_time(&s)),
                        stop: get_attribute(e, "stop").and_then(|s| parse_xmltv_time(&s)),
                        title: String::new(),
                        description: String::new(),
                    });
                }
                b"title" if state == ParserState::Programme => {
                    state = ParserState::Title;
                    text_buf.clear();
                }
                b"desc" if state == ParserState::Programme => {
                    state = ParserState::Desc;
                    text_buf.clear();
                }
                b"display-name" if state == ParserState::Channel => {
                    state = ParserState::DisplayName;
                    text_buf.clear();
                }
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if matches!(
                    state,
                    ParserState::Title | ParserState::Desc | ParserState::DisplayName
                ) {
                    text_buf.push_str(&decode_entities(&String::from_utf8_lossy(e.as_ref())));
                }
            }
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"channel" => {
                    if let Some(decl) = current_channel.take() {
                        if !decl.id.is_empty() {
                            aliases.entry(decl.id).or_default().extend(decl.aliases);
                        }
                    }
                    state = ParserState::Root;
                }
                b"display-name" => {
                    if let Some(decl) = current_channel.as_mut() {
                        let alias = text_buf.trim().to_string();
                        if !alias.is_empty() {
                            decl.aliases.push(alias);
                        }
                    }
                    state = ParserState::Channel;
                }
                b"title" => {
                    if let Some(prog) = current_programme.as_mut() {
                        prog.title = text_buf.trim().to_string();
                    }
                    state = ParserState::Programme;
                }
                b"desc" => {
                    if let Some(prog) = current_programme.as_mut() {
                        prog.description = text_buf.trim().to_string();
                    }
                    state = ParserState::Programme;
                }
                b"programme" => {
                    if let Some(prog) = current_programme.take() {
                        if fold_programme(prog, &aliases, index, eval_ts, &mut result.now_next) {
                            matched += 1;
                        }
                    }
                    state = ParserState::Root;
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                result.error_count += 1;
                if result.errors.len() < MAX_RETAINED_ERRORS {
                    result.errors.push(format!("XML error at byte {}: {}", position, e));
                }
                // Skip the malformed element and keep walking
                current_channel = None;
                current_programme = None;
                text_buf.clear();
                state = ParserState::Root;
            }
            _ => {}
        }
        buf.clear();
    }

    debug!(
        "Guide walk matched {} programmes onto {} channels ({} XML errors)",
        matched,
        result.now_next.len(),
        result.error_count
    );
    Ok(result)
}

/// Fold one completed programme into the projection. Returns whether it
/// was matched to a channel and had a valid interval.
fn fold_programme(
    prog: ProgrammeDecl,
    aliases: &HashMap<String, Vec<String>>,
    index: &MatchingIndex,
    eval_ts: i64,
    now_next: &mut HashMap<String, NowNext>,
) -> bool {
    if prog.channel.is_empty() || prog.title.is_empty() {
        return false;
    }
    let (Some(start), Some(stop)) = (prog.start, prog.stop) else {
        return false;
    };
    if stop <= start {
        return false;
    }
    // Already-finished broadcasts contribute neither now nor next; keep
    // the channel out of the map instead of inserting an empty projection
    if stop <= eval_ts {
        return false;
    }

    let known_aliases = aliases
        .get(&prog.channel)
        .map(|v| v.as_slice())
        .unwrap_or_default();
    let Some(channel_id) = index.resolve(&prog.channel, known_aliases) else {
        return false;
    };

    let program = Program {
        title: prog.title,
        description: if prog.description.is_empty() {
            None
        } else {
            Some(prog.description)
        },
        start_utc: start,
        end_utc: stop,
    };
    now_next
        .entry(channel_id.to_string())
        .or_default()
        .consider(program, eval_ts);
    true
}

fn get_attribute(e: &BytesStart, name: &str) -> Option<String> {
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == name.as_bytes() {
            let raw = String::from_utf8_lossy(attr.value.as_ref());
            return Some(decode_entities(&raw));
        }
    }
    None
}

/// Resolve the named and numeric XML entities that show up in real feeds;
/// anything unrecognized is kept verbatim
fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let Some(end) = rest.find(';').filter(|e| *e <= 10) else {
            out.push('&');
            rest = &rest[1..];
            continue;
        };

        let entity = &rest[1..end];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity.strip_prefix('#').and_then(|num| {
                let code = match num.strip_prefix(['x', 'X']) {
                    Some(hex) => u32::from_str_radix(hex, 16).ok(),
                    None => num.parse().ok(),
                };
                code.and_then(char::from_u32)
            }),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Parse an XMLTV timestamp to a Unix timestamp.
///
/// Primary shape is `YYYYMMDDHHMMSS +HHMM`; without an offset suffix the
/// time is interpreted in the local timezone.
pub(crate) fn parse_xmltv_time(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let (digits, offset) = match raw.find(' ') {
        Some(pos) => (&raw[..pos], Some(raw[pos + 1..].trim())),
        None if raw.len() > 14 => (&raw[..14], Some(raw[14..].trim())),
        None => (raw, None),
    };

    if digits.len() < 14 {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(&digits[..14], "%Y%m%d%H%M%S").ok()?;

    match offset.filter(|o| !o.is_empty()) {
        Some(offset) => {
            let offset_secs = parse_tz_offset(offset)?;
            Some(naive.and_utc().timestamp() - offset_secs)
        }
        None => Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.timestamp()),
    }
}

/// `+0130` -> 5400, `-0500` -> -18000
fn parse_tz_offset(tz: &str) -> Option<i64> {
    let sign = if tz.starts_with('-') { -1 } else { 1 };
    let digits = tz.trim_start_matches(['+', '-']);
    if digits.len() < 4 {
        return None;
    }
    let hours: i64 = digits[0..2].parse().ok()?;
    let minutes: i64 = digits[2..4].parse().ok()?;
    Some(sign * (hours * 3600 + minutes * 60))
}
