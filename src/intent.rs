//! Intent parsing for spoken workout commands
//!
//! A closed grammar, not a general NLU model. Command verbs are found with an
//! Aho-Corasick automaton over the normalized utterance; numbers are read with the
//! units-aware scanner in [`crate::numbers`] and assigned to slots by the words
//! around them. The exercise name is the longest span left over.

use aho_corasick::AhoCorasick;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::matcher::normalize_name;
use crate::numbers::{self, NumberSpan, Unit};

/// Kind of command recognized in an utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    LogSet,
    StartWorkout,
    EditLast,
    UndoLast,
    RestTimer,
    Unknown,
}

/// Slot values extracted from an utterance; anything malformed stays `None`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Slots {
    pub exercise_name: Option<String>,
    pub reps: Option<u32>,
    pub weight_kg: Option<f32>,
    pub rpe: Option<f32>,
    pub set_index: Option<u32>,
    pub seconds: Option<u32>,
}

impl Slots {
    /// Whether any field that `edit_last` can change was spoken
    pub fn has_edit_fields(&self) -> bool {
        self.exercise_name.is_some()
            || self.reps.is_some()
            || self.weight_kg.is_some()
            || self.rpe.is_some()
            || self.set_index.is_some()
    }
}

/// A typed command extracted from one utterance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedIntent {
    pub kind: IntentKind,
    pub slots: Slots,
    pub raw_utterance: String,
    /// Carried through untouched; gating happens in the confirmation machine
    pub stt_confidence: f32,
}

/// One word of the utterance in original and normalized form
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub text: String,
    pub norm: String,
}

/// Split an utterance into tokens, breaking on whitespace and hyphens
pub fn tokenize(utterance: &str) -> Vec<Token> {
    let mut tokens: Vec<Token> = utterance
        .split(|c: char| c.is_whitespace() || c == '-' || c == '–')
        .filter_map(|piece| {
            let text = piece.trim_matches(|c: char| !c.is_alphanumeric());
            let norm = normalize_token(text);
            if norm.is_empty() {
                None
            } else {
                Some(Token {
                    text: text.to_string(),
                    norm,
                })
            }
        })
        .collect();

    // "r p e" spelled out by the recognizer
    let mut i = 0;
    while i + 2 < tokens.len() {
        if tokens[i].norm == "r" && tokens[i + 1].norm == "p" && tokens[i + 2].norm == "e" {
            let merged = Token {
                text: "RPE".to_string(),
                norm: "rpe".to_string(),
            };
            tokens.splice(i..i + 3, [merged]);
        }
        i += 1;
    }

    tokens
}

/// Lowercase and drop punctuation, keeping a decimal point between digits
fn normalize_token(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    for (i, &c) in chars.iter().enumerate() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
        } else if c == '.' {
            let digit_before = i > 0 && chars[i - 1].is_ascii_digit();
            let digit_after = chars.get(i + 1).is_some_and(|n| n.is_ascii_digit());
            if digit_before && digit_after {
                out.push('.');
            }
        }
    }
    out
}

/// Command phrases, grouped by intent in priority order
const COMMANDS: &[(IntentKind, &[&str])] = &[
    (
        IntentKind::UndoLast,
        &[
            "undo",
            "undo that",
            "undo last",
            "scratch that",
            "delete that",
            "delete last set",
            "remove last set",
            "take that back",
        ],
    ),
    (
        IntentKind::EditLast,
        &[
            "change last",
            "change the last",
            "change that",
            "edit last",
            "edit the last",
            "edit that",
            "fix last",
            "fix the last",
            "correct last",
            "correct the last",
            "update last",
            "update the last",
            "make that",
        ],
    ),
    (
        IntentKind::StartWorkout,
        &[
            "start workout",
            "start a workout",
            "start my workout",
            "start the workout",
            "begin workout",
            "begin a workout",
            "begin my workout",
            "new workout",
            "start training",
        ],
    ),
    (
        IntentKind::LogSet,
        &["log", "record", "add", "track", "i did", "just did"],
    ),
    (
        IntentKind::RestTimer,
        &[
            "rest",
            "rest timer",
            "timer",
            "start timer",
            "start a timer",
            "start rest",
            "set a timer",
        ],
    ),
];

/// Words that are grammar, not part of an exercise name
const FILLER_WORDS: &[&str] = &[
    "a", "an", "the", "my", "i", "just", "did", "please", "then", "now", "ok", "okay", "um",
    "uh", "so", "last", "that", "it", "is", "was", "set", "sets", "number", "at", "for",
    "with", "of", "and", "to", "by", "on", "rpe", "weight", "reps", "rep", "seconds",
    "minutes", "another", "again",
];

/// Words that name the slot a following number belongs to ("rpe eight", "set three")
fn slot_keyword(word: &str) -> Option<SlotRole> {
    match word {
        "rpe" | "effort" => Some(SlotRole::Rpe),
        "set" | "number" => Some(SlotRole::SetIndex),
        "reps" | "rep" | "repetitions" => Some(SlotRole::Reps),
        "weight" | "load" => Some(SlotRole::Weight(Unit::Kilograms)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotRole {
    Reps,
    Weight(Unit),
    Rpe,
    SetIndex,
    Seconds(Unit),
}

/// Parser for the closed command grammar
pub struct IntentParser {
    automaton: AhoCorasick,
    /// Priority rank (index into `COMMANDS`) of each pattern
    pattern_ranks: Vec<usize>,
}

impl Default for IntentParser {
    fn default() -> Self {
        Self::new()
    }
}

impl IntentParser {
    pub fn new() -> Self {
        let mut patterns = Vec::new();
        let mut pattern_ranks = Vec::new();
        for (rank, (_, phrases)) in COMMANDS.iter().enumerate() {
            for phrase in phrases.iter() {
                patterns.push(*phrase);
                pattern_ranks.push(rank);
            }
        }

        let automaton = AhoCorasick::new(&patterns).expect("command patterns are valid");

        Self {
            automaton,
            pattern_ranks,
        }
    }

    /// Parse an utterance into a typed intent
    ///
    /// `vocabulary` holds known exercise names; a name found verbatim in the
    /// utterance is preferred over the leftover-span heuristic, which lets names
    /// containing number words or filler ("one arm row") survive.
    pub fn parse<S: AsRef<str>>(
        &self,
        utterance: &str,
        stt_confidence: f32,
        vocabulary: &[S],
    ) -> ParsedIntent {
        let tokens = tokenize(utterance);
        let mut consumed = vec![false; tokens.len()];

        let (command_kind, command_tokens) = self.find_command(&tokens);
        for i in command_tokens {
            consumed[i] = true;
        }

        let mut slots = Slots::default();

        // known exercise names first
        if let Some((start, end)) = find_vocabulary_span(&tokens, &consumed, vocabulary) {
            slots.exercise_name = Some(join_text(&tokens[start..end]));
            for flag in &mut consumed[start..end] {
                *flag = true;
            }
        }

        let masked: Vec<String> = tokens
            .iter()
            .zip(&consumed)
            .map(|(t, &c)| if c { String::new() } else { t.norm.clone() })
            .collect();
        let spans = numbers::scan(&masked);

        let context = command_kind.unwrap_or(IntentKind::LogSet);
        assign_number_slots(&tokens, &spans, context, &mut slots, &mut consumed);

        if slots.exercise_name.is_none() {
            slots.exercise_name = longest_name_span(&tokens, &consumed);
        }

        let kind = match command_kind {
            Some(kind) => kind,
            None if slots.reps.is_some() && slots.exercise_name.is_some() => IntentKind::LogSet,
            None => IntentKind::Unknown,
        };

        debug!("Parsed '{}' as {:?} {:?}", utterance, kind, slots);

        ParsedIntent {
            kind,
            slots,
            raw_utterance: utterance.to_string(),
            stt_confidence,
        }
    }

    /// Highest-priority command phrase on word boundaries, and the tokens it covers
    fn find_command(&self, tokens: &[Token]) -> (Option<IntentKind>, Vec<usize>) {
        let (text, offsets) = joined_norm(tokens);
        let mut best: Option<(usize, usize, usize, usize)> = None; // rank, len, start, end
        let mut covered = Vec::new();

        for m in self.automaton.find_overlapping_iter(&text) {
            if !on_word_boundary(&text, m.start(), m.end()) {
                continue;
            }
            let rank = self.pattern_ranks[m.pattern().as_usize()];
            let len = m.end() - m.start();
            let better = match best {
                None => true,
                Some((best_rank, best_len, ..)) => {
                    rank < best_rank || (rank == best_rank && len > best_len)
                }
            };
            if better {
                best = Some((rank, len, m.start(), m.end()));
            }
        }

        let Some((rank, _, start, end)) = best else {
            return (None, covered);
        };

        for (i, &offset) in offsets.iter().enumerate() {
            if offset >= start && offset < end {
                covered.push(i);
            }
        }

        (Some(COMMANDS[rank].0), covered)
    }
}

/// Join normalized tokens with single spaces, recording each token's byte offset
fn joined_norm(tokens: &[Token]) -> (String, Vec<usize>) {
    let mut text = String::new();
    let mut offsets = Vec::with_capacity(tokens.len());
    for token in tokens {
        if !text.is_empty() {
            text.push(' ');
        }
        offsets.push(text.len());
        text.push_str(&token.norm);
    }
    (text, offsets)
}

fn on_word_boundary(text: &str, start: usize, end: usize) -> bool {
    let bytes = text.as_bytes();
    (start == 0 || bytes[start - 1] == b' ') && (end == bytes.len() || bytes[end] == b' ')
}

fn join_text(tokens: &[Token]) -> String {
    tokens
        .iter()
        .map(|t| t.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Longest vocabulary entry appearing as a run of unconsumed tokens
fn find_vocabulary_span<S: AsRef<str>>(
    tokens: &[Token],
    consumed: &[bool],
    vocabulary: &[S],
) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize)> = None;

    for name in vocabulary {
        let words: Vec<String> = normalize_name(name.as_ref())
            .split_whitespace()
            .map(String::from)
            .collect();
        if words.is_empty() || words.len() > tokens.len() {
            continue;
        }

        for start in 0..=tokens.len() - words.len() {
            let end = start + words.len();
            let hit = tokens[start..end]
                .iter()
                .zip(&words)
                .all(|(t, w)| t.norm == *w)
                && !consumed[start..end].iter().any(|&c| c);
            let longer = best.is_none_or(|(s, e)| end - start > e - s);
            if hit && longer {
                best = Some((start, end));
            }
        }
    }

    best
}

/// Decide which slot each number fills from its neighbours
fn assign_number_slots(
    tokens: &[Token],
    spans: &[NumberSpan],
    context: IntentKind,
    slots: &mut Slots,
    consumed: &mut [bool],
) {
    let word = |i: usize| tokens.get(i).map(|t| t.norm.as_str()).unwrap_or("");
    let mut unassigned = Vec::new();

    for span in spans {
        for flag in &mut consumed[span.start..span.end] {
            *flag = true;
        }
        if span.value.is_none() {
            debug!("Dropping malformed number at token {}", span.start);
            continue;
        }

        let following_unit = Unit::from_word(word(span.end));
        let before = if span.start > 0 { word(span.start - 1) } else { "" };
        // "rpe of eight", "reps to six"
        let keyword_before = match before {
            "of" | "to" | "is" if span.start >= 2 => slot_keyword(word(span.start - 2)),
            _ => slot_keyword(before),
        };

        let role = if let Some(unit) = span.attached_unit {
            Some(role_for_unit(unit))
        } else if let Some(unit) = following_unit {
            consumed[span.end] = true;
            Some(role_for_unit(unit))
        } else if let Some(role) = keyword_before {
            Some(role)
        } else if span.ordinal || word(span.end) == "set" {
            Some(SlotRole::SetIndex)
        } else if before == "at" && context != IntentKind::RestTimer {
            Some(SlotRole::Weight(Unit::Kilograms))
        } else if before == "for" {
            Some(if context == IntentKind::RestTimer {
                SlotRole::Seconds(Unit::Seconds)
            } else {
                SlotRole::Reps
            })
        } else {
            None
        };

        match role {
            Some(role) => fill_slot(slots, role, span),
            None => unassigned.push(span),
        }
    }

    // positional fallback
    for span in unassigned {
        let role = if context == IntentKind::RestTimer {
            SlotRole::Seconds(Unit::Seconds)
        } else if slots.reps.is_none() {
            SlotRole::Reps
        } else if slots.weight_kg.is_none() {
            SlotRole::Weight(Unit::Kilograms)
        } else {
            continue;
        };
        fill_slot(slots, role, span);
    }
}

fn role_for_unit(unit: Unit) -> SlotRole {
    if unit.is_weight() {
        SlotRole::Weight(unit)
    } else if unit.is_duration() {
        SlotRole::Seconds(unit)
    } else {
        SlotRole::Reps
    }
}

/// Store a value if it is valid for its slot and the slot is still empty
fn fill_slot(slots: &mut Slots, role: SlotRole, span: &NumberSpan) {
    let Some(value) = span.value else {
        return;
    };

    match role {
        SlotRole::Reps => {
            if slots.reps.is_none() {
                slots.reps = span.as_count();
            }
        }
        SlotRole::SetIndex => {
            if slots.set_index.is_none() {
                slots.set_index = span.as_count();
            }
        }
        SlotRole::Rpe => {
            if slots.rpe.is_none() && (1.0..=10.0).contains(&value) {
                slots.rpe = Some(value as f32);
            }
        }
        SlotRole::Weight(unit) => {
            if slots.weight_kg.is_none() && value > 0.0 {
                slots.weight_kg = Some(unit.to_canonical(value) as f32);
            }
        }
        SlotRole::Seconds(unit) => {
            let seconds = unit.to_canonical(value);
            if slots.seconds.is_none() && seconds >= 1.0 {
                slots.seconds = Some(seconds.round() as u32);
            }
        }
    }
}

/// Longest run of tokens that are neither consumed nor filler
fn longest_name_span(tokens: &[Token], consumed: &[bool]) -> Option<String> {
    let mut best: Option<(usize, usize)> = None;
    let mut start = None;

    for i in 0..=tokens.len() {
        let usable = i < tokens.len()
            && !consumed[i]
            && !FILLER_WORDS.contains(&tokens[i].norm.as_str())
            && Unit::from_word(&tokens[i].norm).is_none();

        match (usable, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                if best.is_none_or(|(bs, be)| i - s > be - bs) {
                    best = Some((s, i));
                }
                start = None;
            }
            _ => {}
        }
    }

    best.map(|(s, e)| join_text(&tokens[s..e]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_VOCAB: &[&str] = &[];

    fn parse(text: &str) -> ParsedIntent {
        IntentParser::new().parse(text, 0.95, NO_VOCAB)
    }

    #[test]
    fn test_tokenize_strips_punctuation() {
        let tokens = tokenize("Back squat, one-hundred kilos. 62.5kg!");
        let norms: Vec<_> = tokens.iter().map(|t| t.norm.as_str()).collect();
        assert_eq!(
            norms,
            vec!["back", "squat", "one", "hundred", "kilos", "62.5kg"]
        );
        assert_eq!(tokens[1].text, "squat");
    }

    #[test]
    fn test_tokenize_merges_spelled_rpe() {
        let tokens = tokenize("r p e eight");
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].norm, "rpe");
    }

    #[test]
    fn test_full_log_set_utterance() {
        let intent = parse("Back squat, set three, five reps at one-hundred kilos, RPE eight");
        assert_eq!(intent.kind, IntentKind::LogSet);
        assert_eq!(intent.slots.exercise_name.as_deref(), Some("Back squat"));
        assert_eq!(intent.slots.set_index, Some(3));
        assert_eq!(intent.slots.reps, Some(5));
        assert_eq!(intent.slots.weight_kg, Some(100.0));
        assert_eq!(intent.slots.rpe, Some(8.0));
        assert_eq!(intent.stt_confidence, 0.95);
    }

    #[test]
    fn test_log_verb_with_digits() {
        let intent = parse("log bench press 80kg for 8");
        assert_eq!(intent.kind, IntentKind::LogSet);
        assert_eq!(intent.slots.exercise_name.as_deref(), Some("bench press"));
        assert_eq!(intent.slots.weight_kg, Some(80.0));
        assert_eq!(intent.slots.reps, Some(8));
    }

    #[test]
    fn test_pounds_converted() {
        let intent = parse("record deadlift 5 reps at 225 pounds");
        assert_eq!(intent.slots.reps, Some(5));
        assert_eq!(intent.slots.weight_kg, Some(102.06));
    }

    #[test]
    fn test_positional_fallback() {
        let intent = parse("log rows twelve sixty");
        assert_eq!(intent.slots.reps, Some(12));
        assert_eq!(intent.slots.weight_kg, Some(60.0));
        assert_eq!(intent.slots.exercise_name.as_deref(), Some("rows"));
    }

    #[test]
    fn test_undo() {
        assert_eq!(parse("undo").kind, IntentKind::UndoLast);
        assert_eq!(parse("Scratch that.").kind, IntentKind::UndoLast);
    }

    #[test]
    fn test_edit_last() {
        let intent = parse("change the last set to six reps");
        assert_eq!(intent.kind, IntentKind::EditLast);
        assert_eq!(intent.slots.reps, Some(6));
        assert_eq!(intent.slots.exercise_name, None);

        let intent = parse("make that bench press");
        assert_eq!(intent.kind, IntentKind::EditLast);
        assert_eq!(intent.slots.exercise_name.as_deref(), Some("bench press"));
    }

    #[test]
    fn test_start_workout() {
        assert_eq!(parse("start a workout").kind, IntentKind::StartWorkout);
        assert_eq!(parse("Let's begin my workout").kind, IntentKind::StartWorkout);
    }

    #[test]
    fn test_rest_timer() {
        let intent = parse("rest ninety seconds");
        assert_eq!(intent.kind, IntentKind::RestTimer);
        assert_eq!(intent.slots.seconds, Some(90));

        let intent = parse("start a timer for two minutes");
        assert_eq!(intent.kind, IntentKind::RestTimer);
        assert_eq!(intent.slots.seconds, Some(120));

        let intent = parse("rest");
        assert_eq!(intent.slots.seconds, None);
    }

    #[test]
    fn test_command_words_need_word_boundaries() {
        // "rest" inside "interest", "add" inside "adductor"
        let intent = parse("adductor machine twelve reps");
        assert_eq!(intent.kind, IntentKind::LogSet);
        assert_eq!(intent.slots.exercise_name.as_deref(), Some("adductor machine"));
    }

    #[test]
    fn test_unknown() {
        assert_eq!(parse("what's the weather like").kind, IntentKind::Unknown);
        assert_eq!(parse("").kind, IntentKind::Unknown);
    }

    #[test]
    fn test_missing_reps_is_not_implicit_log() {
        let intent = parse("back squat");
        assert_eq!(intent.kind, IntentKind::Unknown);
        assert_eq!(intent.slots.exercise_name.as_deref(), Some("back squat"));
    }

    #[test]
    fn test_malformed_number_dropped() {
        let intent = parse("log squat 1.2.3 reps");
        assert_eq!(intent.kind, IntentKind::LogSet);
        assert_eq!(intent.slots.reps, None);
        assert_eq!(intent.slots.exercise_name.as_deref(), Some("squat"));
    }

    #[test]
    fn test_out_of_range_rpe_dropped() {
        let intent = parse("log squat five reps rpe fifteen");
        assert_eq!(intent.slots.reps, Some(5));
        assert_eq!(intent.slots.rpe, None);
    }

    #[test]
    fn test_vocabulary_protects_number_words() {
        let parser = IntentParser::new();
        let intent = parser.parse("log one arm row ten reps", 0.9, &["One Arm Row"]);
        assert_eq!(intent.slots.exercise_name.as_deref(), Some("one arm row"));
        assert_eq!(intent.slots.reps, Some(10));

        // without vocabulary "one" is read as a number
        let intent = parser.parse("log one arm row ten reps", 0.9, NO_VOCAB);
        assert_eq!(intent.slots.exercise_name.as_deref(), Some("arm row"));
    }

    #[test]
    fn test_confidence_passed_through() {
        let intent = IntentParser::new().parse("undo", 0.12, NO_VOCAB);
        assert_eq!(intent.stt_confidence, 0.12);
        assert_eq!(intent.raw_utterance, "undo");
    }
}
