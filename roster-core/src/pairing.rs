//! Tutor/student pairing history and scoring.
//!
//! A [`Pair`] is one student matched with one tutor for one session on one
//! date. A tutor with three students that day is three pairs. The pairs of
//! all past sessions form the [`HistoricalData`], which is what a proposed
//! pairing is scored against.
//!
//! Scores are sums of [`Annotation`]s: every award or penalty is recorded
//! against the `(tutor, student)` it applies to, so a score can always be
//! explained line by line.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Document, DocumentError, Student, Tutor};

/// Session date as `YYYYMMDD`, which orders like the calendar.
pub type Date = u32;

/// Proposed or past assignment of students to tutors, as `(tutor, student)`.
pub type Pairing = Vec<(String, String)>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PairingError {
    #[error("Unknown tutor '{0}'")]
    UnknownTutor(String),
    #[error("Unknown student '{0}'")]
    UnknownStudent(String),
    #[error("No topic recorded for student '{0}'")]
    MissingTopic(String),
    #[error("No tutors to pair {0} students with")]
    NoTutors(usize),
    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// One student with one tutor for one session.
///
/// The flags are observations recorded after the session and feed the
/// scoring of later pairings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Pair {
    pub date: Date,
    pub session: String,
    pub tutor_first: String,
    pub tutor_last: String,
    pub student: String,
    #[serde(default)]
    pub topic: String,
    /// The tutor should only work one on one.
    #[serde(default)]
    pub tutor_on_own: bool,
    /// The student should only work one on one.
    #[serde(default)]
    pub on_own: bool,
    /// The student should not share a tutor with the others in this group.
    #[serde(default)]
    pub avoid_student: bool,
    /// The student and tutor should not be paired again.
    #[serde(default)]
    pub avoid_tutor: bool,
    #[serde(default)]
    pub good_match: bool,
}

impl Pair {
    pub fn new(date: Date, session: impl Into<String>, tutor: &Tutor, student: impl Into<String>) -> Self {
        Self {
            date,
            session: session.into(),
            tutor_first: tutor.first.clone(),
            tutor_last: tutor.last.clone(),
            student: student.into(),
            ..Self::default()
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Tutor's full name, the key tutors are matched by.
    pub fn tutor(&self) -> String {
        Tutor::new(self.tutor_first.as_str(), self.tutor_last.as_str()).full_name()
    }
}

/// Which side of a pair [`HistoricalData::most_recent`] groups by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecentBy {
    Student,
    Tutor,
}

/// Every pair of every past session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoricalData {
    pairs: Vec<Pair>,
}

impl HistoricalData {
    pub fn new(pairs: Vec<Pair>) -> Self {
        Self { pairs }
    }

    /// Decode the pairs held in a mirrored collection.
    pub fn from_documents<'a>(
        docs: impl IntoIterator<Item = &'a Document>,
    ) -> Result<Self, DocumentError> {
        let pairs = docs
            .into_iter()
            .map(Document::to_record::<Pair>)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { pairs })
    }

    pub fn pairs(&self) -> &[Pair] {
        &self.pairs
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn add(&mut self, pair: Pair) {
        self.pairs.push(pair);
    }

    pub fn extend(&mut self, pairs: impl IntoIterator<Item = Pair>) {
        self.pairs.extend(pairs);
    }

    /// The pairing used for one session.
    pub fn pairing_on(&self, date: Date, session: &str) -> Pairing {
        self.pairs
            .iter()
            .filter(|p| p.date == date && p.session == session)
            .map(|p| (p.tutor(), p.student.clone()))
            .collect()
    }

    /// History as it stood before `date` for `session`.
    pub fn before(&self, date: Date, session: &str) -> HistoricalData {
        Self::new(
            self.pairs
                .iter()
                .filter(|p| p.date < date && p.session == session)
                .cloned()
                .collect(),
        )
    }

    /// Pairs matching the given tutor and/or student.
    pub fn matches<'a>(
        &'a self,
        tutor: Option<&'a str>,
        student: Option<&'a str>,
    ) -> impl Iterator<Item = &'a Pair> + 'a {
        self.pairs.iter().filter(move |p| {
            tutor.map_or(true, |t| p.tutor() == t) && student.map_or(true, |s| p.student == s)
        })
    }

    /// Groups (one tutor on one date) that held both students.
    pub fn shared_groups(&self, student1: &str, student2: &str) -> Vec<Vec<&Pair>> {
        let mut groups: BTreeMap<(Date, String), Vec<&Pair>> = BTreeMap::new();
        for pair in &self.pairs {
            groups.entry((pair.date, pair.tutor())).or_default().push(pair);
        }
        groups
            .into_values()
            .filter(|group| {
                group.len() > 1
                    && group.iter().any(|p| p.student == student1)
                    && group.iter().any(|p| p.student == student2)
            })
            .collect()
    }

    pub fn all_students(&self) -> Vec<String> {
        let names: BTreeSet<&str> = self.pairs.iter().map(|p| p.student.as_str()).collect();
        names.into_iter().map(str::to_string).collect()
    }

    pub fn all_tutors(&self) -> Vec<String> {
        let names: BTreeSet<String> = self.pairs.iter().map(Pair::tutor).collect();
        names.into_iter().collect()
    }

    /// Latest session date, or the latest one before `date`.
    pub fn previous_date(&self, date: Option<Date>) -> Option<Date> {
        self.pairs
            .iter()
            .map(|p| p.date)
            .filter(|d| date.map_or(true, |limit| *d < limit))
            .max()
    }

    /// Most recent pair per student or per tutor, ignoring sessions on or
    /// after `before`.
    pub fn most_recent(&self, by: RecentBy, before: Option<Date>) -> HashMap<String, &Pair> {
        let mut recent: HashMap<String, &Pair> = HashMap::new();
        for pair in &self.pairs {
            if before.is_some_and(|limit| pair.date >= limit) {
                continue;
            }
            let key = match by {
                RecentBy::Student => pair.student.clone(),
                RecentBy::Tutor => pair.tutor(),
            };
            match recent.get(&key) {
                Some(existing) if existing.date > pair.date => {}
                _ => {
                    recent.insert(key, pair);
                }
            }
        }
        recent
    }

    /// Topic each student last worked on before `before`.
    pub fn recent_topics(&self, before: Option<Date>) -> HashMap<String, String> {
        self.most_recent(RecentBy::Student, before)
            .into_iter()
            .map(|(student, pair)| (student, pair.topic.clone()))
            .collect()
    }

    /// Every pair names a known tutor and a known student.
    pub fn validate(&self, students: &[Student], tutors: &[Tutor]) -> Result<(), PairingError> {
        let tutor_names: BTreeSet<String> = tutors.iter().map(Tutor::full_name).collect();
        let student_names: BTreeSet<&str> = students.iter().map(|s| s.name.as_str()).collect();
        for pair in &self.pairs {
            if !tutor_names.contains(&pair.tutor()) {
                return Err(PairingError::UnknownTutor(pair.tutor()));
            }
            if !student_names.contains(pair.student.as_str()) {
                return Err(PairingError::UnknownStudent(pair.student.clone()));
            }
        }
        Ok(())
    }
}

/// Who is present for a session and what each student will work on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attendance {
    pub date: Option<Date>,
    pub tutors: Vec<String>,
    /// Student name to topic.
    pub students: BTreeMap<String, String>,
}

impl Attendance {
    /// Sheet with every active tutor and student present, each student
    /// carrying the topic of their latest session before `date`.
    pub fn sheet(
        students: &[Student],
        tutors: &[Tutor],
        hist: &HistoricalData,
        date: Option<Date>,
    ) -> Self {
        let topics = hist.recent_topics(date);
        Self {
            date,
            tutors: tutors
                .iter()
                .filter(|t| t.is_active)
                .map(Tutor::full_name)
                .collect(),
            students: students
                .iter()
                .filter(|s| s.is_active)
                .map(|s| {
                    let topic = topics.get(&s.name).cloned().unwrap_or_default();
                    (s.name.clone(), topic)
                })
                .collect(),
        }
    }

    pub fn validate(&self, students: &[Student], tutors: &[Tutor]) -> Result<(), PairingError> {
        for tutor in &self.tutors {
            if !tutors.iter().any(|t| &t.full_name() == tutor) {
                return Err(PairingError::UnknownTutor(tutor.clone()));
            }
        }
        for student in self.students.keys() {
            if !students.iter().any(|s| &s.name == student) {
                return Err(PairingError::UnknownStudent(student.clone()));
            }
        }
        Ok(())
    }

    pub fn student_names(&self) -> Vec<String> {
        self.students.keys().cloned().collect()
    }
}

/// Weights of the pairing score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScoreParams {
    /// Per past session the tutor and student shared.
    pub award_past_work: i64,
    pub award_good_match: i64,
    pub penalty_avoid_tutor: i64,
    /// Multiplied by `(students - 1)^2` for each group.
    pub penalty_multiple_students: i64,
    pub penalty_avoid_student: i64,
    pub penalty_tutor_on_own: i64,
    pub penalty_student_on_own: i64,
    pub penalty_different_topics: i64,
}

impl Default for ScoreParams {
    fn default() -> Self {
        Self {
            award_past_work: 1,
            award_good_match: 5,
            penalty_avoid_tutor: 20,
            penalty_multiple_students: 1,
            penalty_avoid_student: 20,
            penalty_tutor_on_own: 10,
            penalty_student_on_own: 10,
            penalty_different_topics: 10,
        }
    }
}

/// One award or penalty and why it applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub points: i64,
    pub reason: String,
}

/// Total score plus the annotations it is the sum of, keyed by
/// `(tutor, student)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Score {
    pub total: i64,
    pub annotations: BTreeMap<(String, String), Vec<Annotation>>,
}

impl Score {
    fn note(&mut self, tutor: &str, student: &str, points: i64, reason: String) {
        self.total += points;
        log::trace!("Score {}: {points:+} ({reason})", self.total);
        self.annotations
            .entry((tutor.to_string(), student.to_string()))
            .or_default()
            .push(Annotation { points, reason });
    }

    fn merge(&mut self, other: Score) {
        self.total += other.total;
        for (key, mut notes) in other.annotations {
            self.annotations.entry(key).or_default().append(&mut notes);
        }
    }

    /// Points attributed to one tutor's group.
    pub fn tutor_total(&self, tutor: &str) -> i64 {
        self.annotations
            .iter()
            .filter(|((t, _), _)| t == tutor)
            .flat_map(|(_, notes)| notes.iter().map(|n| n.points))
            .sum()
    }
}

/// Score one tutor's group. `topics[i]` is the topic of `students[i]`.
///
/// Group-wide penalties are attached to the first student.
pub fn group_score(
    hist: &HistoricalData,
    tutor: &str,
    students: &[String],
    topics: &[&str],
    params: &ScoreParams,
) -> Score {
    let mut score = Score::default();

    for student in students {
        let prev: Vec<&Pair> = hist.matches(Some(tutor), Some(student)).collect();
        let past_work = prev.len() as i64 * params.award_past_work;
        if past_work > 0 {
            score.note(
                tutor,
                student,
                past_work,
                format!(
                    "+{}*{} because {tutor} and {student} have worked together",
                    prev.len(),
                    params.award_past_work
                ),
            );
        }
        if prev.iter().any(|p| p.avoid_tutor) {
            score.note(
                tutor,
                student,
                -params.penalty_avoid_tutor,
                format!(
                    "-{} because {tutor} and {student} shouldn't work together",
                    params.penalty_avoid_tutor
                ),
            );
        }
        if prev.iter().any(|p| p.good_match) {
            score.note(
                tutor,
                student,
                params.award_good_match,
                format!(
                    "+{} because {tutor} and {student} are a good match",
                    params.award_good_match
                ),
            );
        }
    }

    let n = students.len();
    let Some(first) = students.first().filter(|_| n >= 2) else {
        return score;
    };

    let crowding = ((n - 1) * (n - 1)) as i64 * params.penalty_multiple_students;
    score.note(
        tutor,
        first,
        -crowding,
        format!("-{crowding} because {tutor} is working with {n} students"),
    );

    if topics.iter().skip(1).any(|t| Some(t) != topics.first()) {
        score.note(
            tutor,
            first,
            -params.penalty_different_topics,
            format!(
                "-{} because students {} working with {tutor} are on different topics {}",
                params.penalty_different_topics,
                students.join(" / "),
                topics.join(" / ")
            ),
        );
    }

    if hist.matches(Some(tutor), None).any(|p| p.tutor_on_own) {
        score.note(
            tutor,
            first,
            -params.penalty_tutor_on_own,
            format!(
                "-{} because tutor {tutor} should only work on own",
                params.penalty_tutor_on_own
            ),
        );
    }

    for student in students {
        if hist.matches(None, Some(student)).any(|p| p.on_own) {
            score.note(
                tutor,
                student,
                -params.penalty_student_on_own,
                format!(
                    "-{} because student {student} should only work on own",
                    params.penalty_student_on_own
                ),
            );
        }
    }

    for (i, a) in students.iter().enumerate() {
        for b in &students[i + 1..] {
            let clash = hist
                .shared_groups(a, b)
                .iter()
                .any(|group| group.iter().any(|p| p.avoid_student));
            if clash {
                score.note(
                    tutor,
                    a,
                    -params.penalty_avoid_student,
                    format!(
                        "-{} because students {a} and {b} should not work with each other",
                        params.penalty_avoid_student
                    ),
                );
            }
        }
    }

    score
}

/// Group a pairing by tutor, keeping each tutor's students in order.
pub fn by_tutor(pairing: &[(String, String)]) -> BTreeMap<&str, Vec<String>> {
    let mut groups: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for (tutor, student) in pairing {
        groups.entry(tutor.as_str()).or_default().push(student.clone());
    }
    groups
}

/// Score a whole pairing. Every student needs an entry in `topics`.
pub fn score(
    pairing: &[(String, String)],
    hist: &HistoricalData,
    topics: &HashMap<String, String>,
    params: &ScoreParams,
) -> Result<Score, PairingError> {
    let mut total = Score::default();
    for (tutor, students) in by_tutor(pairing) {
        let group_topics = students
            .iter()
            .map(|s| {
                topics
                    .get(s)
                    .map(String::as_str)
                    .ok_or_else(|| PairingError::MissingTopic(s.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        total.merge(group_score(hist, tutor, &students, &group_topics, params));
    }
    Ok(total)
}

/// Greedy pairing: students with the most past sessions go first, each to
/// the tutor that leaves the running pairing with the highest score.
///
/// Not guaranteed optimal. Ties go to the earlier tutor.
pub fn suggest(
    hist: &HistoricalData,
    students: &[String],
    tutors: &[String],
    topics: &HashMap<String, String>,
    params: &ScoreParams,
) -> Result<Pairing, PairingError> {
    if tutors.is_empty() {
        if students.is_empty() {
            return Ok(Vec::new());
        }
        return Err(PairingError::NoTutors(students.len()));
    }

    let mut order: Vec<(usize, &String)> = students
        .iter()
        .map(|s| (hist.matches(None, Some(s)).count(), s))
        .collect();
    order.sort_by(|(a_count, a), (b_count, b)| b_count.cmp(a_count).then_with(|| a.cmp(b)));

    let mut pairing: Pairing = Vec::with_capacity(students.len());
    for (_, student) in order {
        let mut best: Option<(i64, &String)> = None;
        for tutor in tutors {
            pairing.push((tutor.clone(), student.clone()));
            let candidate = score(&pairing, hist, topics, params)?.total;
            pairing.pop();
            if best.map_or(true, |(top, _)| candidate > top) {
                best = Some((candidate, tutor));
            }
        }
        if let Some((_, tutor)) = best {
            pairing.push((tutor.clone(), student.clone()));
        }
    }
    log::debug!("Suggested pairing of {} students with {} tutors", students.len(), tutors.len());
    Ok(pairing)
}

/// Topics going into a past session. A student's first session has none.
pub fn session_topics(
    hist: &HistoricalData,
    date: Date,
    actual: &[(String, String)],
) -> HashMap<String, String> {
    let mut topics = hist.recent_topics(Some(date));
    for (_, student) in actual {
        topics.entry(student.clone()).or_default();
    }
    topics
}

/// Score the pairing actually used for a past session against the history
/// before it.
pub fn score_session(
    hist: &HistoricalData,
    date: Date,
    session: &str,
    params: &ScoreParams,
) -> Result<Score, PairingError> {
    let actual = hist.pairing_on(date, session);
    let topics = session_topics(hist, date, &actual);
    score(&actual, &hist.before(date, session), &topics, params)
}

/// What [`suggest`] would have proposed for a past session, using the same
/// people who attended it.
pub fn suggest_for_session(
    hist: &HistoricalData,
    date: Date,
    session: &str,
    params: &ScoreParams,
) -> Result<Pairing, PairingError> {
    let actual = hist.pairing_on(date, session);
    let students: Vec<String> = actual
        .iter()
        .map(|(_, s)| s.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let tutors: Vec<String> = actual
        .iter()
        .map(|(t, _)| t.clone())
        .filter(|t| !t.trim().is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let topics = session_topics(hist, date, &actual);
    suggest(&hist.before(date, session), &students, &tutors, &topics, params)
}
