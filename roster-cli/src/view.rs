//! Plain-text rendering of the student list, pairings and mirror events.

use roster_collab::MirrorEvent;
use roster_core::pairing::{by_tutor, Score};
use roster_core::{Document, Student};

/// One line per student, in mirror order.
pub fn render(collection: &str, items: &[Document]) -> String {
    let mut out = format!("── {collection} ({}) ──\n", items.len());
    if items.is_empty() {
        out.push_str("  (empty)\n");
        return out;
    }
    let width = items
        .iter()
        .filter_map(Document::id)
        .map(str::len)
        .max()
        .unwrap_or(0);
    for doc in items {
        let id = doc.id().unwrap_or("-");
        out.push_str(&format!("  {id:<width$}  {}\n", describe(doc)));
    }
    out
}

fn describe(doc: &Document) -> String {
    match doc.to_record::<Student>() {
        Ok(student) => {
            let mut line = student.name;
            if !student.grade.is_empty() {
                line.push_str(&format!(" (grade {})", student.grade));
            }
            line
        }
        Err(_) => doc.get_str("name").unwrap_or("(unnamed)").to_string(),
    }
}

/// Status line for events worth telling the user about.
pub fn status(event: &MirrorEvent) -> Option<String> {
    match event {
        MirrorEvent::SyncStarted => Some("sync on".to_string()),
        MirrorEvent::SyncStopped => Some("sync off".to_string()),
        MirrorEvent::SyncFailed { reason } => Some(format!("sync stopped: {reason}")),
        MirrorEvent::OperationFailed { op, error } => Some(format!("{op} failed: {error}")),
        _ => None,
    }
}

fn tutor_label(tutor: &str) -> &str {
    if tutor.trim().is_empty() {
        "<no tutor listed>"
    } else {
        tutor
    }
}

fn students_of(pairing: &[(String, String)], tutor: &str) -> Vec<String> {
    let mut students: Vec<String> = pairing
        .iter()
        .filter(|(t, _)| t == tutor)
        .map(|(_, s)| s.clone())
        .collect();
    students.sort();
    students
}

/// One line per tutor, followed by the score's reasons when given.
pub fn render_pairing(pairing: &[(String, String)], score: Option<&Score>) -> String {
    let mut out = String::new();
    for tutor in by_tutor(pairing).into_keys() {
        let students = students_of(pairing, tutor);
        out.push_str(&format!("{:<20} : {}
", tutor_label(tutor), students.join(" / ")));
        let Some(score) = score else {
            continue;
        };
        for ((t, _), notes) in &score.annotations {
            if t != tutor {
                continue;
            }
            for note in notes {
                out.push_str(&format!("{:<24}{}
", "", note.reason));
            }
        }
    }
    out
}

/// Tutors whose group differs between two pairings, with the change in
/// their groups' points when both scores are given.
pub fn render_diff(
    before: &[(String, String)],
    after: &[(String, String)],
    scores: Option<(&Score, &Score)>,
) -> String {
    let old = by_tutor(before);
    let new = by_tutor(after);
    let delta = |tutor: &str| match scores {
        Some((a, b)) => format!(" (score difference: {:+})", b.tutor_total(tutor) - a.tutor_total(tutor)),
        None => String::new(),
    };

    let mut out = String::new();
    for &tutor in old.keys() {
        let label = tutor_label(tutor);
        if !new.contains_key(tutor) {
            out.push_str(&format!("-{label}{}
", delta(tutor)));
            continue;
        }
        let was = students_of(before, tutor);
        let now = students_of(after, tutor);
        if was != now {
            out.push_str(&format!(
                " {label}: {} -> {}{}
",
                was.join(" / "),
                now.join(" / "),
                delta(tutor)
            ));
        }
    }
    for &tutor in new.keys() {
        if !old.contains_key(tutor) {
            out.push_str(&format!("+{}{}
", tutor_label(tutor), delta(tutor)));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use roster_collab::{MirrorError, MirrorOp};
    use roster_core::pairing::{score, HistoricalData, Pair, ScoreParams};
    use roster_core::Tutor;
    use std::collections::HashMap;

    fn pairing(list: &[(&str, &str)]) -> Vec<(String, String)> {
        list.iter().map(|(t, s)| (t.to_string(), s.to_string())).collect()
    }

    fn student(id: &str, name: &str, grade: &str) -> Document {
        let record = Student {
            grade: grade.to_string(),
            ..Student::named(name)
        };
        Document::from_record(&record).unwrap().with_id(id)
    }

    #[test]
    fn test_render_empty() {
        assert_eq!(render("students", &[]), "── students (0) ──\n  (empty)\n");
    }

    #[test]
    fn test_render_aligns_ids() {
        let items = vec![student("s1", "Ana", ""), student("s10", "Ben", "4")];
        let text = render("students", &items);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "── students (2) ──");
        assert_eq!(lines[1], "  s1   Ana");
        assert_eq!(lines[2], "  s10  Ben (grade 4)");
    }

    #[test]
    fn test_status_lines() {
        assert_eq!(status(&MirrorEvent::Cleared), None);
        assert_eq!(status(&MirrorEvent::SyncStarted).as_deref(), Some("sync on"));
        let failed = MirrorEvent::OperationFailed {
            op: MirrorOp::Remove,
            error: MirrorError::NotFound("s1".into()),
        };
        assert_eq!(
            status(&failed).as_deref(),
            Some("remove failed: Document not found: s1")
        );
    }

    #[test]
    fn test_render_pairing_groups_by_tutor() {
        let used = pairing(&[("Grace Hopper", "Ben"), ("", "Cy"), ("Grace Hopper", "Ana")]);
        let text = render_pairing(&used, None);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], format!("{:<20} : Cy", "<no tutor listed>"));
        assert_eq!(lines[1], format!("{:<20} : Ana / Ben", "Grace Hopper"));
    }

    #[test]
    fn test_render_pairing_with_reasons() {
        let hist = HistoricalData::new(vec![Pair::new(20130105, "am", &Tutor::new("Grace", "Hopper"), "Ana")]);
        let used = pairing(&[("Grace Hopper", "Ana")]);
        let topics = HashMap::from([("Ana".to_string(), String::new())]);
        let score = score(&used, &hist, &topics, &ScoreParams::default()).unwrap();

        let text = render_pairing(&used, Some(&score));
        assert!(text.ends_with("+1*1 because Grace Hopper and Ana have worked together\n"));
    }

    #[test]
    fn test_render_diff() {
        let used = pairing(&[("Grace Hopper", "Ana"), ("Grace Hopper", "Ben"), ("Ada Lovelace", "Cy")]);
        let suggested = pairing(&[("Grace Hopper", "Ana"), ("Alan Turing", "Ben"), ("Ada Lovelace", "Cy")]);
        let text = render_diff(&used, &suggested, None);
        assert_eq!(text, " Grace Hopper: Ana / Ben -> Ana\n+Alan Turing\n");
        assert_eq!(render_diff(&used, &used, None), "");
    }
}
