use serde::{Deserialize, Serialize};

/// A named, time-bounded interval of a job log.
///
/// Timestamps are unix seconds as written by the runner. `end` is `None` for
/// a section that was still open when the log ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub name: String,
    pub start: i64,
    pub end: Option<i64>,
}

/// What to do with sections still open at end of input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EofPolicy {
    /// Emit them without an end so the caller can backfill it.
    LeaveOpen,
    /// Emit them closed at the given timestamp.
    CloseAt(i64),
}

#[derive(Debug)]
struct OpenSection {
    name: String,
    start: i64,
}

/// Name-matching stack of section markers.
#[derive(Debug, Default)]
pub struct SectionStack {
    open: Vec<OpenSection>,
    closed: Vec<Section>,
}

impl SectionStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, name: &str, start: i64) {
        self.open.push(OpenSection {
            name: name.to_string(),
            start,
        });
    }

    /// Closes the innermost section called `name`.
    ///
    /// Every section opened after it is closed at the same timestamp, innermost
    /// first. An end marker with no matching open section is ignored.
    pub fn end(&mut self, name: &str, end: i64) {
        if !self.open.iter().any(|s| s.name == name) {
            return;
        }

        while let Some(section) = self.open.pop() {
            let matched = section.name == name;
            self.closed.push(Section {
                name: section.name,
                start: section.start,
                end: Some(end),
            });
            if matched {
                break;
            }
        }
    }

    /// Consumes the stack, returning closed sections in close order followed by
    /// the still-open ones, innermost first.
    pub fn finish(mut self, policy: EofPolicy) -> Vec<Section> {
        let end = match policy {
            EofPolicy::LeaveOpen => None,
            EofPolicy::CloseAt(ts) => Some(ts),
        };
        while let Some(section) = self.open.pop() {
            self.closed.push(Section {
                name: section.name,
                start: section.start,
                end,
            });
        }
        self.closed
    }
}

/// Fills in the end of open-ended sections.
pub fn backfill_open(sections: &mut [Section], end: i64) {
    for section in sections.iter_mut().filter(|s| s.end.is_none()) {
        section.end = Some(end.max(section.start));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(sections: &[Section]) -> Vec<&str> {
        sections.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn properly_nested_sections_all_close() {
        let mut stack = SectionStack::new();
        stack.start("outer", 10);
        stack.start("inner", 11);
        stack.end("inner", 12);
        stack.start("second", 13);
        stack.end("second", 15);
        stack.end("outer", 20);

        let sections = stack.finish(EofPolicy::LeaveOpen);
        assert_eq!(sections.len(), 3);
        assert_eq!(names(&sections), ["inner", "second", "outer"]);
        for section in &sections {
            let end = section.end.expect("closed");
            assert!(section.start <= end, "{section:?}");
        }
    }

    #[test]
    fn mismatched_end_closes_everything_above_match() {
        let mut stack = SectionStack::new();
        stack.start("A", 1);
        stack.start("B", 2);
        stack.end("A", 5);

        let sections = stack.finish(EofPolicy::LeaveOpen);
        assert_eq!(
            sections,
            vec![
                Section {
                    name: "B".into(),
                    start: 2,
                    end: Some(5)
                },
                Section {
                    name: "A".into(),
                    start: 1,
                    end: Some(5)
                },
            ]
        );
    }

    #[test]
    fn unknown_end_marker_is_ignored() {
        let mut stack = SectionStack::new();
        stack.start("A", 1);
        stack.end("nope", 3);

        let sections = stack.finish(EofPolicy::LeaveOpen);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].end, None);
    }

    #[test]
    fn eof_policy_close_at() {
        let mut stack = SectionStack::new();
        stack.start("A", 1);
        stack.start("B", 2);

        let sections = stack.finish(EofPolicy::CloseAt(9));
        assert_eq!(names(&sections), ["B", "A"]);
        assert!(sections.iter().all(|s| s.end == Some(9)));
    }

    #[test]
    fn backfill_only_touches_open_sections() {
        let mut sections = vec![
            Section {
                name: "done".into(),
                start: 1,
                end: Some(2),
            },
            Section {
                name: "open".into(),
                start: 3,
                end: None,
            },
        ];
        backfill_open(&mut sections, 10);
        assert_eq!(sections[0].end, Some(2));
        assert_eq!(sections[1].end, Some(10));
    }
}
