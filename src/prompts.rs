//! Spoken prompt templates

use crate::matcher::MatchCandidate;
use crate::types::SetDraft;

/// Render a number without a trailing ".0"
pub fn format_number(value: f32) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        let text = format!("{:.2}", value);
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

/// "Back Squat, set 3, 5 reps at 100 kilos, RPE 8"
pub fn describe_set(draft: &SetDraft) -> String {
    let mut text = draft.exercise_name.clone();
    if let Some(index) = draft.set_index {
        text.push_str(&format!(", set {}", index));
    }
    let noun = if draft.reps == 1 { "rep" } else { "reps" };
    text.push_str(&format!(", {} {}", draft.reps, noun));
    if let Some(weight) = draft.weight_kg {
        text.push_str(&format!(" at {} kilos", format_number(weight)));
    }
    if let Some(rpe) = draft.rpe {
        text.push_str(&format!(", RPE {}", format_number(rpe)));
    }
    text
}

pub fn confirm_set(draft: &SetDraft) -> String {
    format!("Log {}?", describe_set(draft))
}

pub fn confirm_edit(draft: &SetDraft) -> String {
    format!("Change the last set to {}?", describe_set(draft))
}

pub fn confirm_undo(draft: &SetDraft) -> String {
    format!("Remove the last set, {}?", describe_set(draft))
}

/// Question listing at most `limit` candidates
pub fn disambiguate(candidates: &[MatchCandidate], limit: usize) -> String {
    let names: Vec<&str> = candidates
        .iter()
        .take(limit.max(1))
        .map(|c| c.exercise.name.as_str())
        .collect();

    match names.as_slice() {
        [] => not_understood(),
        [only] => format!("Did you mean {}?", only),
        [init @ .., last] => format!("Did you mean {}, or {}?", init.join(", "), last),
    }
}

pub fn logged(draft: &SetDraft) -> String {
    format!("Logged {}.", describe_set(draft))
}

pub fn edited(draft: &SetDraft) -> String {
    format!("Updated to {}.", describe_set(draft))
}

pub fn undone(draft: &SetDraft) -> String {
    format!("Removed {}.", draft.exercise_name)
}

pub fn saved_offline() -> String {
    "Saved. I'll sync it when you're back online.".to_string()
}

pub fn rejected(reason: &str) -> String {
    format!("I couldn't save that: {}.", reason)
}

pub fn cancelled() -> String {
    "Okay, cancelled.".to_string()
}

pub fn timed_out() -> String {
    "I didn't hear an answer, so I didn't save it.".to_string()
}

pub fn unknown_exercise(name: &str) -> String {
    format!("I didn't catch that exercise: {}.", name)
}

pub fn not_understood() -> String {
    "Sorry, I didn't understand that command.".to_string()
}

pub fn missing_reps(exercise: &str) -> String {
    format!("How many reps of {}?", exercise)
}

pub fn missing_exercise() -> String {
    "Which exercise was that?".to_string()
}

pub fn missing_edit_fields() -> String {
    "What should I change on the last set?".to_string()
}

pub fn nothing_to_undo() -> String {
    "There's nothing to undo.".to_string()
}

pub fn nothing_to_edit() -> String {
    "There's no set to change yet.".to_string()
}

pub fn need_workout() -> String {
    "Start a workout first, then log your sets.".to_string()
}

pub fn workout_started() -> String {
    "Workout started.".to_string()
}

pub fn already_in_workout() -> String {
    "You're already in a workout.".to_string()
}

pub fn rest_started(seconds: u32) -> String {
    if seconds % 60 == 0 && seconds >= 60 {
        let minutes = seconds / 60;
        let noun = if minutes == 1 { "minute" } else { "minutes" };
        format!("Resting for {} {}.", minutes, noun)
    } else {
        format!("Resting for {} seconds.", seconds)
    }
}

pub fn rest_over() -> String {
    "Rest's over. Time for your next set.".to_string()
}

pub fn reprompt_yes_no() -> String {
    "Please say yes or no.".to_string()
}

pub fn reprompt_choice(candidates: &[MatchCandidate], limit: usize) -> String {
    format!("Sorry, which one? {}", disambiguate(candidates, limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Exercise;

    fn draft() -> SetDraft {
        let mut draft = SetDraft::new(&Exercise::new("e1", "Back Squat"), 5);
        draft.set_index = Some(3);
        draft.weight_kg = Some(100.0);
        draft.rpe = Some(8.0);
        draft
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(100.0), "100");
        assert_eq!(format_number(62.5), "62.5");
        assert_eq!(format_number(45.36), "45.36");
    }

    #[test]
    fn test_describe_set() {
        assert_eq!(
            describe_set(&draft()),
            "Back Squat, set 3, 5 reps at 100 kilos, RPE 8"
        );
        let single = SetDraft::new(&Exercise::new("e2", "Deadlift"), 1);
        assert_eq!(describe_set(&single), "Deadlift, 1 rep");
    }

    #[test]
    fn test_disambiguation_lists_limited_candidates() {
        let candidates: Vec<MatchCandidate> = ["Standing Press", "Seated Dumbbell Press", "Bench Press", "Leg Press"]
            .iter()
            .enumerate()
            .map(|(i, name)| MatchCandidate {
                exercise: Exercise::new(format!("e{i}"), *name),
                score: 0.9,
            })
            .collect();
        assert_eq!(
            disambiguate(&candidates, 3),
            "Did you mean Standing Press, Seated Dumbbell Press, or Bench Press?"
        );
        assert_eq!(
            disambiguate(&candidates[..1], 3),
            "Did you mean Standing Press?"
        );
    }

    #[test]
    fn test_rest_started() {
        assert_eq!(rest_started(90), "Resting for 90 seconds.");
        assert_eq!(rest_started(120), "Resting for 2 minutes.");
        assert_eq!(rest_started(60), "Resting for 1 minute.");
    }
}
