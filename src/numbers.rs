//! Units-aware scanner for spoken numbers
//!
//! Turns normalized tokens like `["one", "hundred", "kilos"]` into numeric spans.
//! Handles digits ("100", "62.5"), digits with an attached unit ("100kg", "3rd"),
//! cardinal words ("sixty two point five", "a hundred and ten", "two and a half")
//! and ordinal words ("third", "twenty first").

use std::sync::LazyLock;

use regex::Regex;

/// Digits with an optional alphabetic suffix, e.g. "100", "62.5", "100kg", "3rd"
static DIGIT_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+(?:\.\d+)?)([a-z]+)?$").expect("digit token pattern is valid")
});

const KILOGRAMS_PER_POUND: f64 = 0.453_592_37;

/// Unit word attached to or following a number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Kilograms,
    Pounds,
    Reps,
    Seconds,
    Minutes,
}

impl Unit {
    /// Recognize a unit word (already lowercased)
    pub fn from_word(word: &str) -> Option<Self> {
        match word {
            "kg" | "kgs" | "kilo" | "kilos" | "kilogram" | "kilograms" | "kilogrammes" => {
                Some(Self::Kilograms)
            }
            "lb" | "lbs" | "pound" | "pounds" => Some(Self::Pounds),
            "rep" | "reps" | "repetition" | "repetitions" | "times" | "x" => Some(Self::Reps),
            "s" | "sec" | "secs" | "second" | "seconds" => Some(Self::Seconds),
            "min" | "mins" | "minute" | "minutes" => Some(Self::Minutes),
            _ => None,
        }
    }

    pub fn is_weight(self) -> bool {
        matches!(self, Self::Kilograms | Self::Pounds)
    }

    pub fn is_duration(self) -> bool {
        matches!(self, Self::Seconds | Self::Minutes)
    }

    /// Convert a value in this unit to the canonical unit (kg or seconds)
    pub fn to_canonical(self, value: f64) -> f64 {
        match self {
            Self::Pounds => (value * KILOGRAMS_PER_POUND * 100.0).round() / 100.0,
            Self::Minutes => value * 60.0,
            _ => value,
        }
    }
}

/// A run of tokens that forms one number
#[derive(Debug, Clone, PartialEq)]
pub struct NumberSpan {
    /// Index of the first token
    pub start: usize,
    /// One past the last token
    pub end: usize,
    /// `None` when the expression was malformed and must be ignored
    pub value: Option<f64>,
    pub ordinal: bool,
    /// Unit glued onto a digit token ("100kg")
    pub attached_unit: Option<Unit>,
}

impl NumberSpan {
    /// Value as a positive whole number, if it is one
    pub fn as_count(&self) -> Option<u32> {
        let value = self.value?;
        if value >= 1.0 && value.fract() == 0.0 && value <= u32::MAX as f64 {
            Some(value as u32)
        } else {
            None
        }
    }
}

fn unit_word(word: &str) -> Option<u64> {
    let value = match word {
        "zero" => 0,
        "one" => 1,
        "two" => 2,
        "three" => 3,
        "four" => 4,
        "five" => 5,
        "six" => 6,
        "seven" => 7,
        "eight" => 8,
        "nine" => 9,
        _ => return None,
    };
    Some(value)
}

fn teen_word(word: &str) -> Option<u64> {
    let value = match word {
        "ten" => 10,
        "eleven" => 11,
        "twelve" => 12,
        "thirteen" => 13,
        "fourteen" => 14,
        "fifteen" => 15,
        "sixteen" => 16,
        "seventeen" => 17,
        "eighteen" => 18,
        "nineteen" => 19,
        _ => return None,
    };
    Some(value)
}

fn tens_word(word: &str) -> Option<u64> {
    let value = match word {
        "twenty" => 20,
        "thirty" => 30,
        "forty" => 40,
        "fifty" => 50,
        "sixty" => 60,
        "seventy" => 70,
        "eighty" => 80,
        "ninety" => 90,
        _ => return None,
    };
    Some(value)
}

fn ordinal_word(word: &str) -> Option<u64> {
    let value = match word {
        "first" => 1,
        "second" => 2,
        "third" => 3,
        "fourth" => 4,
        "fifth" => 5,
        "sixth" => 6,
        "seventh" => 7,
        "eighth" => 8,
        "ninth" => 9,
        "tenth" => 10,
        "eleventh" => 11,
        "twelfth" => 12,
        _ => return None,
    };
    Some(value)
}

/// Whether `word` can begin a spoken number
pub fn is_number_word(word: &str) -> bool {
    unit_word(word).is_some()
        || teen_word(word).is_some()
        || tens_word(word).is_some()
        || matches!(word, "hundred" | "thousand")
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Last {
    Start,
    Unit,
    Teen,
    Tens,
    Hundred,
    Thousand,
}

/// Parse a cardinal (or ordinal) word number at the start of `tokens`
///
/// Returns `(value, consumed, ordinal)`; `value` is `None` for malformed input.
fn parse_words(tokens: &[&str]) -> Option<(Option<f64>, usize, bool)> {
    let mut total: u64 = 0;
    let mut current: u64 = 0;
    let mut last = Last::Start;
    let mut i = 0;

    while i < tokens.len() {
        let word = tokens[i];

        if last == Last::Start && word == "a" {
            // "a hundred", "a thousand"
            if matches!(tokens.get(i + 1), Some(&"hundred") | Some(&"thousand")) {
                current = 1;
                last = Last::Unit;
                i += 1;
                continue;
            }
            return None;
        }

        if let Some(v) = unit_word(word) {
            if !matches!(last, Last::Start | Last::Tens | Last::Hundred | Last::Thousand) {
                break;
            }
            if last == Last::Tens && current % 10 != 0 {
                break;
            }
            current += v;
            last = Last::Unit;
        } else if let Some(v) = teen_word(word) {
            if !matches!(last, Last::Start | Last::Hundred | Last::Thousand) {
                break;
            }
            current += v;
            last = Last::Teen;
        } else if let Some(v) = tens_word(word) {
            if !matches!(last, Last::Start | Last::Hundred | Last::Thousand) {
                break;
            }
            current += v;
            last = Last::Tens;
        } else if let Some(v) = ordinal_word(word) {
            // "third", "twenty first"; "second" after a number is the time unit
            if word == "second" && last != Last::Start {
                break;
            }
            if !matches!(last, Last::Start | Last::Tens) {
                break;
            }
            if last == Last::Tens && v >= 10 {
                break;
            }
            return Some((Some((total + current + v) as f64), i + 1, true));
        } else if word == "hundred" {
            if !matches!(last, Last::Unit | Last::Teen | Last::Tens) || current == 0 {
                return Some((None, i + 1, false));
            }
            current *= 100;
            last = Last::Hundred;
        } else if word == "thousand" {
            if last == Last::Start || last == Last::Thousand || current == 0 {
                return Some((None, i + 1, false));
            }
            total += current * 1000;
            current = 0;
            last = Last::Thousand;
        } else if word == "and" && last != Last::Start {
            // "two and a half"
            if tokens.get(i + 1) == Some(&"a") && tokens.get(i + 2) == Some(&"half") {
                return Some((Some((total + current) as f64 + 0.5), i + 3, false));
            }
            // "one hundred and ten"
            let next_is_number = tokens.get(i + 1).is_some_and(|w| is_number_word(w));
            if matches!(last, Last::Hundred | Last::Thousand) && next_is_number {
                i += 1;
                continue;
            }
            break;
        } else if word == "point" && last != Last::Start {
            let mut digits = String::new();
            let mut j = i + 1;
            while let Some(d) = tokens.get(j).and_then(|w| unit_word(w)) {
                digits.push_str(&d.to_string());
                j += 1;
            }
            if digits.is_empty() {
                // "ten point" with nothing after it
                return Some((None, i + 1, false));
            }
            let value = format!("{}.{}", total + current, digits).parse::<f64>().ok();
            return Some((value, j, false));
        } else {
            break;
        }

        i += 1;
    }

    if last == Last::Start {
        return None;
    }
    Some((Some((total + current) as f64), i, false))
}

/// Parse a digit token, possibly with a suffix
fn parse_digit_token(token: &str) -> Option<(Option<f64>, bool, Option<Unit>)> {
    if !token.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }

    let Some(caps) = DIGIT_TOKEN.captures(token) else {
        // starts like a number but isn't one ("1.2.3", "5x5")
        return Some((None, false, None));
    };

    let value = caps[1].parse::<f64>().ok();
    match caps.get(2).map(|m| m.as_str()) {
        None => Some((value, false, None)),
        Some("st" | "nd" | "rd" | "th") => Some((value, true, None)),
        Some(suffix) => match Unit::from_word(suffix) {
            Some(unit) => Some((value, false, Some(unit))),
            None => Some((None, false, None)),
        },
    }
}

/// Find every number expression in a normalized token list
pub fn scan(tokens: &[String]) -> Vec<NumberSpan> {
    let words: Vec<&str> = tokens.iter().map(String::as_str).collect();
    let mut spans = Vec::new();
    let mut i = 0;

    while i < words.len() {
        if let Some((value, ordinal, attached_unit)) = parse_digit_token(words[i]) {
            spans.push(NumberSpan {
                start: i,
                end: i + 1,
                value,
                ordinal,
                attached_unit,
            });
            i += 1;
            continue;
        }

        // "second" on its own is ambiguous with the time unit; only take it as an
        // ordinal when it is not directly preceded by a number
        if words[i] == "second" && spans.last().is_some_and(|s: &NumberSpan| s.end == i) {
            i += 1;
            continue;
        }

        if let Some((value, consumed, ordinal)) = parse_words(&words[i..]) {
            spans.push(NumberSpan {
                start: i,
                end: i + consumed,
                value,
                ordinal,
                attached_unit: None,
            });
            i += consumed.max(1);
            continue;
        }

        i += 1;
    }

    spans
}
