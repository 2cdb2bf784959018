//! Aggregates vertex records into the ordered list of build steps shown to the user.

use crate::event::ActiveImageBuildStep;
use crate::trace::VertexRecord;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tracing::{trace, Span};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Active,
    Cached,
    Done,
    Errored(String),
}

impl StepStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Active)
    }

    /// The text shown after `#N ` once the step is finished.
    pub fn terminal_line(&self) -> Option<String> {
        match self {
            Self::Active => None,
            Self::Cached => Some("CACHED".into()),
            Self::Done => Some("DONE".into()),
            Self::Errored(message) => Some(format!("ERROR: {message}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStep {
    /// Vertex digest.
    pub id: String,

    /// 1-based position in start order.
    pub display_index: usize,
    pub name: String,
    pub status: StepStatus,

    /// Status and log lines, already formatted but without the `#N ` prefix.
    pub detail_lines: Vec<String>,

    /// When the vertex first started, measured from the unix epoch.
    pub started_at: Option<Duration>,

    /// Set once the step's terminal line has been rendered. Sealed steps ignore further records.
    pub sealed: bool,

    finished_statuses: HashSet<String>,
    downloads: BTreeMap<String, (u64, u64)>,
}

impl BuildStep {
    fn new(id: &str, display_index: usize, name: &str) -> Self {
        Self {
            id: id.to_string(),
            display_index,
            name: name.to_string(),
            status: StepStatus::Active,
            detail_lines: vec![],
            started_at: None,
            sealed: false,
            finished_statuses: HashSet::new(),
            downloads: BTreeMap::new(),
        }
    }

    fn as_active(&self) -> ActiveImageBuildStep {
        if self.downloads.is_empty() {
            return ActiveImageBuildStep::NotDownloading {
                step_index: self.display_index,
                name: self.name.clone(),
            };
        }

        let (bytes_downloaded, total_bytes) = self
            .downloads
            .values()
            .fold((0, 0), |(current, total), (c, t)| (current + c, total + t));

        ActiveImageBuildStep::Downloading {
            step_index: self.display_index,
            name: self.name.clone(),
            bytes_downloaded,
            total_bytes,
        }
    }

    fn complete(&mut self, cached: bool, error: Option<String>) {
        self.status = match (&self.status, error) {
            (_, Some(message)) => StepStatus::Errored(message),
            (StepStatus::Errored(message), None) => StepStatus::Errored(message.clone()),
            (StepStatus::Cached, None) => StepStatus::Cached,
            (_, None) if cached => StepStatus::Cached,
            (_, None) => StepStatus::Done,
        };
    }

    fn push_log(&mut self, timestamp: Duration, data: &[u8]) {
        let offset = timestamp.saturating_sub(self.started_at.unwrap_or(timestamp));
        let text = String::from_utf8_lossy(data);
        let text = text.strip_suffix('\n').unwrap_or(&text);

        for line in text.split('\n') {
            self.detail_lines.push(format!(
                "{}.{:03} {line}",
                offset.as_secs(),
                offset.subsec_millis()
            ));
        }
    }
}

/// Tracks every vertex the daemon has told us about and the steps created for the ones that started.
#[derive(Debug)]
pub struct StepTracker {
    span: Span,

    /// Vertex digest to the first non-empty name declared for it.
    declared: HashMap<String, String>,

    /// Vertex digest to position in `steps`.
    positions: HashMap<String, usize>,
    steps: Vec<BuildStep>,

    /// Display indices of steps that started and have not finished.
    active: BTreeSet<usize>,
}

impl StepTracker {
    pub fn new(span: Span) -> Self {
        Self {
            span,
            declared: HashMap::new(),
            positions: HashMap::new(),
            steps: vec![],
            active: BTreeSet::new(),
        }
    }

    pub fn apply(&mut self, record: VertexRecord) {
        match record {
            VertexRecord::VertexInfo { id, name } => {
                if name.is_empty() {
                    self.declared.entry(id).or_default();
                    return;
                }

                if let Some(step) = self.existing_step(&id) {
                    if step.name.is_empty() {
                        step.name.clone_from(&name);
                    }
                }

                let declared = self.declared.entry(id).or_default();
                if declared.is_empty() {
                    *declared = name;
                }
            }
            VertexRecord::VertexStarted { id, started } => {
                let Some(step) = self.step_for(&id) else {
                    return;
                };
                step.started_at.get_or_insert(started);
            }
            VertexRecord::VertexCompleted { id, cached, error } => {
                let Some(step) = self.step_for(&id) else {
                    return;
                };
                if step.sealed {
                    return;
                }

                step.complete(cached, error);
                let index = step.display_index;
                self.active.remove(&index);
            }
            VertexRecord::VertexStatus {
                vertex_id,
                status_text,
                current,
                total,
                completed,
                ..
            } => {
                let Some(step) = self.step_for(&vertex_id) else {
                    return;
                };
                if step.sealed {
                    return;
                }

                if total > 0 {
                    step.downloads.insert(
                        status_text.clone(),
                        (
                            u64::try_from(current).unwrap_or_default(),
                            u64::try_from(total).unwrap_or_default(),
                        ),
                    );
                }

                if completed && step.finished_statuses.insert(status_text.clone()) {
                    step.detail_lines.push(format!("{status_text}: done"));
                }
            }
            VertexRecord::VertexLog {
                vertex_id,
                timestamp,
                data,
            } => {
                let Some(step) = self.step_for(&vertex_id) else {
                    return;
                };
                if step.sealed || data.is_empty() {
                    return;
                }

                step.push_log(timestamp, &data);
            }
        }
    }

    /// Steps in display order.
    pub fn steps(&self) -> &[BuildStep] {
        &self.steps
    }

    /// The step with the given 1-based display index.
    pub fn step(&self, display_index: usize) -> Option<&BuildStep> {
        display_index
            .checked_sub(1)
            .and_then(|position| self.steps.get(position))
    }

    /// Marks a step as fully rendered.
    pub fn seal(&mut self, display_index: usize) {
        if let Some(step) = display_index
            .checked_sub(1)
            .and_then(|position| self.steps.get_mut(position))
        {
            step.sealed = true;
        }
    }

    /// Steps that have started but not finished, ordered by display index.
    pub fn active_steps(&self) -> Vec<ActiveImageBuildStep> {
        self.active
            .iter()
            .filter_map(|&index| self.step(index))
            .map(BuildStep::as_active)
            .collect()
    }

    fn existing_step(&mut self, id: &str) -> Option<&mut BuildStep> {
        let position = *self.positions.get(id)?;
        self.steps.get_mut(position)
    }

    /// Finds the step for a vertex, creating it if this is the first sign of activity for the vertex.
    fn step_for(&mut self, id: &str) -> Option<&mut BuildStep> {
        if let Some(&position) = self.positions.get(id) {
            return self.steps.get_mut(position);
        }

        let Some(name) = self.declared.get(id) else {
            trace!(parent: &self.span, vertex = id, "Discarded record for undeclared vertex");
            return None;
        };

        let position = self.steps.len();
        self.steps.push(BuildStep::new(id, position + 1, name));
        self.positions.insert(id.to_string(), position);
        self.active.insert(position + 1);

        trace!(parent: &self.span, vertex = id, step = position + 1, name = %name, "Build step started");

        self.steps.get_mut(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn info(id: &str, name: &str) -> VertexRecord {
        VertexRecord::VertexInfo {
            id: id.into(),
            name: name.into(),
        }
    }

    fn started(id: &str, secs: u64) -> VertexRecord {
        VertexRecord::VertexStarted {
            id: id.into(),
            started: Duration::from_secs(secs),
        }
    }

    fn completed(id: &str, cached: bool, error: Option<&str>) -> VertexRecord {
        VertexRecord::VertexCompleted {
            id: id.into(),
            cached,
            error: error.map(str::to_string),
        }
    }

    fn status(id: &str, text: &str, current: i64, total: i64, done: bool) -> VertexRecord {
        VertexRecord::VertexStatus {
            vertex_id: id.into(),
            status_text: text.into(),
            current,
            total,
            started: true,
            completed: done,
        }
    }

    #[test]
    fn display_index_follows_start_order() {
        let mut tracker = StepTracker::new(Span::none());
        tracker.apply(info("run", "[2/2] RUN true"));
        tracker.apply(info("from", "[1/2] FROM alpine"));
        tracker.apply(started("from", 1));
        tracker.apply(started("run", 2));

        assert_eq!(tracker.step(1).unwrap().name, "[1/2] FROM alpine");
        assert_eq!(tracker.step(2).unwrap().name, "[2/2] RUN true");
        assert!(tracker.step(3).is_none());
        assert!(tracker.step(0).is_none());
    }

    #[test]
    fn first_non_empty_name_wins() {
        let mut tracker = StepTracker::new(Span::none());
        tracker.apply(info("a", ""));
        tracker.apply(started("a", 1));
        tracker.apply(info("a", "load build context"));
        tracker.apply(info("a", "renamed"));

        assert_eq!(tracker.step(1).unwrap().name, "load build context");
    }

    #[test]
    fn declared_but_not_started_vertex_has_no_step() {
        let mut tracker = StepTracker::new(Span::none());
        tracker.apply(info("a", "step a"));

        assert!(tracker.steps().is_empty());
        assert!(tracker.active_steps().is_empty());
    }

    #[test]
    fn records_for_undeclared_vertex_are_discarded() {
        let mut tracker = StepTracker::new(Span::none());
        tracker.apply(started("ghost", 1));
        tracker.apply(status("ghost", "resolve", 0, 0, true));

        assert!(tracker.steps().is_empty());
    }

    #[test]
    fn completion_without_start_creates_finished_step() {
        let mut tracker = StepTracker::new(Span::none());
        tracker.apply(info("a", "step a"));
        tracker.apply(completed("a", false, None));

        let step = tracker.step(1).unwrap();
        assert_eq!(step.status, StepStatus::Done);
        assert_eq!(step.started_at, None);
    }

    #[test]
    fn cached_and_error_completions_are_sticky() {
        let mut tracker = StepTracker::new(Span::none());
        tracker.apply(info("a", "a"));
        tracker.apply(info("b", "b"));
        tracker.apply(completed("a", false, None));
        tracker.apply(completed("a", true, None));
        tracker.apply(completed("a", false, None));
        tracker.apply(completed("b", false, Some("exit code: 1")));
        tracker.apply(completed("b", false, None));

        assert_eq!(tracker.step(1).unwrap().status, StepStatus::Cached);
        assert_eq!(
            tracker.step(2).unwrap().status,
            StepStatus::Errored("exit code: 1".into())
        );
    }

    #[test]
    fn sealed_step_ignores_updates() {
        let mut tracker = StepTracker::new(Span::none());
        tracker.apply(info("a", "a"));
        tracker.apply(completed("a", false, None));
        tracker.seal(1);
        tracker.apply(completed("a", true, None));
        tracker.apply(status("a", "late", 0, 0, true));

        let step = tracker.step(1).unwrap();
        assert_eq!(step.status, StepStatus::Done);
        assert!(step.detail_lines.is_empty());
    }

    #[test]
    fn completed_status_is_reported_once() {
        let mut tracker = StepTracker::new(Span::none());
        tracker.apply(info("a", "exporting to image"));
        tracker.apply(started("a", 1));
        tracker.apply(status("a", "exporting layers", 0, 0, false));
        tracker.apply(status("a", "exporting layers", 0, 0, true));
        tracker.apply(status("a", "exporting layers", 0, 0, true));

        assert_eq!(
            tracker.step(1).unwrap().detail_lines,
            vec!["exporting layers: done".to_string()]
        );
    }

    #[test]
    fn log_lines_are_offset_from_step_start() {
        let mut tracker = StepTracker::new(Span::none());
        tracker.apply(info("a", "RUN"));
        tracker.apply(VertexRecord::VertexStarted {
            id: "a".into(),
            started: Duration::new(100, 29_008_729),
        });
        tracker.apply(VertexRecord::VertexLog {
            vertex_id: "a".into(),
            timestamp: Duration::new(101, 210_731_330),
            data: b"first\nsecond\n".to_vec(),
        });
        tracker.apply(VertexRecord::VertexLog {
            vertex_id: "a".into(),
            timestamp: Duration::new(102, 0),
            data: vec![],
        });

        assert_eq!(
            tracker.step(1).unwrap().detail_lines,
            vec!["1.181 first".to_string(), "1.181 second".to_string()]
        );
    }

    #[test]
    fn active_steps_report_download_progress() {
        let mut tracker = StepTracker::new(Span::none());
        tracker.apply(info("pull", "[1/2] FROM alpine"));
        tracker.apply(info("ctx", "load build context"));
        tracker.apply(started("pull", 1));
        tracker.apply(started("ctx", 1));
        tracker.apply(status("pull", "sha256:layer1", 10, 100, false));
        tracker.apply(status("pull", "sha256:layer2", 5, 50, false));
        tracker.apply(status("pull", "sha256:layer1", 40, 100, false));

        assert_eq!(
            tracker.active_steps(),
            vec![
                ActiveImageBuildStep::Downloading {
                    step_index: 1,
                    name: "[1/2] FROM alpine".into(),
                    bytes_downloaded: 45,
                    total_bytes: 150,
                },
                ActiveImageBuildStep::NotDownloading {
                    step_index: 2,
                    name: "load build context".into(),
                },
            ]
        );

        tracker.apply(completed("pull", false, None));
        assert_eq!(tracker.active_steps().len(), 1);
    }

    #[test]
    fn terminal_lines() {
        assert_eq!(StepStatus::Active.terminal_line(), None);
        assert_eq!(StepStatus::Cached.terminal_line().unwrap(), "CACHED");
        assert_eq!(StepStatus::Done.terminal_line().unwrap(), "DONE");
        assert_eq!(
            StepStatus::Errored("boom".into()).terminal_line().unwrap(),
            "ERROR: boom"
        );
    }
}
