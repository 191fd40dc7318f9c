//! Pairing subcommands: load the roster and past pairings from their
//! mirrored collections, then suggest, score or record pairings.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use roster_collab::{CollectionMirror, MirrorConfig, Registry};
use roster_core::pairing::{self, Attendance, Date, HistoricalData, Pair, Pairing, ScoreParams};
use roster_core::{Document, Student, Tutor};
use serde::de::DeserializeOwned;

use crate::commands::{provider, BoxError};
use crate::view;

pub const STUDENTS: &str = "students";
pub const TUTORS: &str = "tutors";
pub const PAIRINGS: &str = "pairings";

/// Where the roster lives.
#[derive(Args, Debug, Clone, Default)]
pub struct RosterArgs {
    /// RocksDB directory; collections are kept in memory when omitted
    #[clap(long)]
    pub data: Option<PathBuf>,
    /// Replica server base URL; collections are synced once before use
    #[clap(long)]
    pub remote: Option<String>,
}

/// Which session to pair and how to weigh it.
#[derive(Args, Debug, Clone)]
pub struct SessionArgs {
    /// Session date as YYYYMMDD
    #[clap(long)]
    pub date: Date,
    /// Session name, e.g. am_purple
    #[clap(long)]
    pub session: String,
    /// JSON file overriding score weights
    #[clap(long)]
    pub params: Option<PathBuf>,
    /// Show why each group scored what it did
    #[clap(long, short)]
    pub verbose: bool,
}

pub struct Roster {
    registry: Registry,
    synced: bool,
}

impl Roster {
    pub fn open(args: RosterArgs) -> Self {
        let synced = args.remote.is_some();
        let mut config = MirrorConfig::default();
        if let Some(remote) = args.remote {
            config = config.with_remote(remote);
        }
        Self {
            registry: Registry::new(provider(args.data), config),
            synced,
        }
    }

    /// Mirror of `name`, fully loaded (and synced when a remote is set).
    async fn collection(&self, name: &str) -> Result<Arc<CollectionMirror>, BoxError> {
        let mirror = self.registry.get(name).await;
        let report = if self.synced {
            mirror.sync_once().await?
        } else {
            mirror.refresh().await?
        };
        for (id, error) in &report.failed {
            log::warn!("Skipping {name}/{id}: {error}");
        }
        Ok(mirror)
    }

    async fn records<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>, BoxError> {
        let mirror = self.collection(name).await?;
        let records = mirror
            .items()
            .iter()
            .map(Document::to_record)
            .collect::<Result<Vec<T>, _>>()?;
        Ok(records)
    }

    async fn history(&self) -> Result<HistoricalData, BoxError> {
        let mirror = self.collection(PAIRINGS).await?;
        Ok(HistoricalData::from_documents(&mirror.items())?)
    }

    /// Push local writes to the remote, if there is one.
    async fn publish(&self, name: &str) -> Result<(), BoxError> {
        if self.synced {
            self.registry.get(name).await.sync_once().await?;
        }
        Ok(())
    }
}

async fn load_params(path: Option<&Path>) -> Result<ScoreParams, BoxError> {
    match path {
        Some(path) => {
            let text = tokio::fs::read_to_string(path).await?;
            Ok(serde_json::from_str(&text)?)
        }
        None => Ok(ScoreParams::default()),
    }
}

/// Id of a saved pair; a student is paired once per session.
fn pair_id(pair: &Pair) -> String {
    format!("{}-{}-{}", pair.date, pair.session, pair.student)
}

pub async fn add_tutor(roster: &Roster, first: String, last: String) -> Result<Document, BoxError> {
    let tutor = Tutor::new(first, last);
    let mirror = roster.collection(TUTORS).await?;
    let added = mirror.add(Document::from_record(&tutor)?).await?;
    roster.publish(TUTORS).await?;
    Ok(added)
}

/// Suggest a pairing for everyone active on the roster. Returns the
/// pairing and the attendance it was built from.
pub async fn suggest(
    roster: &Roster,
    session: &SessionArgs,
) -> Result<(Pairing, Attendance), BoxError> {
    let params = load_params(session.params.as_deref()).await?;
    let students: Vec<Student> = roster.records(STUDENTS).await?;
    let tutors: Vec<Tutor> = roster.records(TUTORS).await?;
    let hist = roster.history().await?;

    let attendance = Attendance::sheet(&students, &tutors, &hist, Some(session.date));
    let topics: HashMap<String, String> = attendance.students.clone().into_iter().collect();
    let suggested = pairing::suggest(
        &hist,
        &attendance.student_names(),
        &attendance.tutors,
        &topics,
        &params,
    )?;
    let score = pairing::score(&suggested, &hist, &topics, &params)?;

    println!("Suggested pairing for {} {} (score {})", session.date, session.session, score.total);
    print!(
        "{}",
        view::render_pairing(&suggested, session.verbose.then_some(&score))
    );
    Ok((suggested, attendance))
}

/// Record a pairing as the history of `session`.
pub async fn save(
    roster: &Roster,
    session: &SessionArgs,
    pairing: &Pairing,
    attendance: &Attendance,
) -> Result<usize, BoxError> {
    let mirror = roster.collection(PAIRINGS).await?;
    for (tutor, student) in pairing {
        let topic = attendance.students.get(student).cloned().unwrap_or_default();
        let tutor = Tutor::from_full_name(tutor);
        let pair = Pair::new(session.date, session.session.as_str(), &tutor, student.as_str())
            .with_topic(topic);
        let doc = Document::from_record(&pair)?.with_id(pair_id(&pair));
        mirror.add(doc).await?;
    }
    roster.publish(PAIRINGS).await?;
    log::info!("Saved {} pairs for {} {}", pairing.len(), session.date, session.session);
    Ok(pairing.len())
}

/// Compare the pairing used for a past session with what would have been
/// suggested.
pub async fn score_past(roster: &Roster, session: &SessionArgs) -> Result<(i64, i64), BoxError> {
    let params = load_params(session.params.as_deref()).await?;
    let hist = roster.history().await?;

    let actual = hist.pairing_on(session.date, &session.session);
    if actual.is_empty() {
        return Err(format!("No pairing recorded for {} {}", session.date, session.session).into());
    }
    let actual_score = pairing::score_session(&hist, session.date, &session.session, &params)?;
    let best = pairing::suggest_for_session(&hist, session.date, &session.session, &params)?;
    let best_score = pairing::score(
        &best,
        &hist.before(session.date, &session.session),
        &pairing::session_topics(&hist, session.date, &best),
        &params,
    )?;

    let verbose = session.verbose;
    println!("Score of the pairing used: {}", actual_score.total);
    println!("Score of the suggested pairing: {}", best_score.total);
    println!("\nUsed on {} {}:", session.date, session.session);
    print!("{}", view::render_pairing(&actual, verbose.then_some(&actual_score)));
    println!("\nSuggested:");
    print!("{}", view::render_pairing(&best, verbose.then_some(&best_score)));
    println!("\nDifferences:");
    print!(
        "{}",
        view::render_diff(&actual, &best, verbose.then_some((&actual_score, &best_score)))
    );
    Ok((actual_score.total, best_score.total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use roster_collab::MemoryProvider;

    fn roster() -> Roster {
        Roster {
            registry: Registry::new(Arc::new(MemoryProvider::new()), MirrorConfig::for_testing()),
            synced: false,
        }
    }

    fn session(date: Date) -> SessionArgs {
        SessionArgs {
            date,
            session: "am".into(),
            params: None,
            verbose: true,
        }
    }

    async fn enroll(roster: &Roster, names: &[&str]) {
        let students = roster.collection(STUDENTS).await.unwrap();
        for name in names {
            students
                .add(Document::from_record(&Student::named(*name)).unwrap())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_suggest_save_then_score() {
        let roster = roster();
        enroll(&roster, &["Ana", "Ben"]).await;
        add_tutor(&roster, "Grace".into(), "Hopper".into()).await.unwrap();
        add_tutor(&roster, "Alan".into(), "Turing".into()).await.unwrap();

        let (pairing, attendance) = suggest(&roster, &session(20130105)).await.unwrap();
        assert_eq!(pairing.len(), 2);
        // Two tutors for two students: nobody shares
        assert_ne!(pairing[0].0, pairing[1].0);

        assert_eq!(save(&roster, &session(20130105), &pairing, &attendance).await.unwrap(), 2);
        let hist = roster.history().await.unwrap();
        assert_eq!(hist.len(), 2);
        assert_eq!(hist.pairing_on(20130105, "am").len(), 2);

        // Saving the same session twice is refused
        assert!(save(&roster, &session(20130105), &pairing, &attendance).await.is_err());

        let (actual, best) = score_past(&roster, &session(20130105)).await.unwrap();
        assert_eq!(actual, best);
    }

    #[tokio::test]
    async fn test_score_past_without_history() {
        let roster = roster();
        assert!(score_past(&roster, &session(20130105)).await.is_err());
    }

    #[tokio::test]
    async fn test_suggest_without_tutors_fails() {
        let roster = roster();
        enroll(&roster, &["Ana"]).await;
        assert!(suggest(&roster, &session(20130105)).await.is_err());
    }

    #[tokio::test]
    async fn test_params_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        std::fs::write(&path, r#"{"penalty_avoid_tutor": 50}"#).unwrap();
        let params = load_params(Some(&path)).await.unwrap();
        assert_eq!(params.penalty_avoid_tutor, 50);
        assert_eq!(params.award_good_match, 5);

        std::fs::write(&path, r#"{"penalty_lateness": 1}"#).unwrap();
        assert!(load_params(Some(&path)).await.is_err());
    }
}
