//! Turns a fetched [`PipelineHierarchy`] into spans.
//!
//! Ids are derived from GitLab ids, so exporting the same hierarchy twice
//! yields identical spans.

use chrono::{TimeZone, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{json, Value};

use crate::gitlab::hierarchy::{HierarchyEntry, PipelineHierarchy};
use crate::gitlab::types::{Bridge, Job, JobSection, Pipeline, PipelineRef, Timestamp};

const ID_MASK: u64 = 0x00FF_FFFF_FFFF_FFFF;

/// What a span stands for. The discriminant is stored in the top byte of the
/// span id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    Pipeline = 1,
    Job = 2,
    Bridge = 3,
    Section = 4,
}

pub fn trace_id(root_pipeline_id: i64) -> String {
    format!("{:032x}", root_pipeline_id as u64)
}

pub fn span_id(kind: SpanKind, id: u64) -> String {
    format!("{:016x}", ((kind as u64) << 56) | (id & ID_MASK))
}

fn section_span_id(job_id: i64, index: usize) -> String {
    span_id(SpanKind::Section, ((job_id as u64) << 16) | (index as u64 & 0xFFFF))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanLink {
    pub trace_id: String,
    pub span_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub kind: SpanKind,
    pub name: String,
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
    pub attributes: IndexMap<String, Value>,
    pub links: Vec<SpanLink>,
}

/// Spans of one pipeline hierarchy, grouped by resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TraceData {
    pub pipelines: Vec<Span>,
    pub jobs: Vec<Span>,
    pub bridges: Vec<Span>,
    pub sections: Vec<Span>,
}

impl TraceData {
    pub fn from_hierarchy(hierarchy: &PipelineHierarchy) -> Self {
        let trace = trace_id(hierarchy.root_id());
        let mut data = Self::default();

        for entry in hierarchy.depth_first() {
            let pipeline = &entry.pipeline;
            let parent = hierarchy
                .parent_of(pipeline.id)
                .and_then(|parent| triggering_bridge(parent, pipeline.id));

            let mut span = pipeline_span(&trace, pipeline, parent);
            if parent.is_none() {
                if let Some(upstream) = &pipeline.upstream {
                    span.links.push(SpanLink {
                        trace_id: trace_id(upstream.id),
                        span_id: span_id(SpanKind::Pipeline, upstream.id as u64),
                    });
                }
            }
            data.pipelines.push(span);

            data.jobs
                .extend(entry.jobs.iter().map(|job| job_span(&trace, job)));
            data.bridges.extend(
                entry
                    .bridges
                    .iter()
                    .map(|bridge| bridge_span(&trace, hierarchy, bridge)),
            );
            data.sections
                .extend(entry.sections.iter().map(|section| section_span(&trace, section)));
        }

        data
    }

    pub fn len(&self) -> usize {
        self.pipelines.len() + self.jobs.len() + self.bridges.len() + self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All spans, pipelines first.
    pub fn into_spans(self) -> Vec<Span> {
        let mut spans = self.pipelines;
        spans.extend(self.jobs);
        spans.extend(self.bridges);
        spans.extend(self.sections);
        spans
    }
}

fn triggering_bridge(parent: &HierarchyEntry, pipeline_id: i64) -> Option<&Bridge> {
    parent.bridges.iter().find(|bridge| {
        bridge
            .downstream
            .as_ref()
            .is_some_and(|down| down.id == pipeline_id)
    })
}

fn pipeline_span(trace: &str, pipeline: &Pipeline, parent: Option<&Bridge>) -> Span {
    let mut attributes = IndexMap::new();
    attributes.insert("project.id".into(), json!(pipeline.project_id));
    attributes.insert("project.path".into(), json!(pipeline.project_path));
    attributes.insert("pipeline.iid".into(), json!(pipeline.iid));
    attributes.insert("pipeline.status".into(), json!(pipeline.status));
    if let Some(source) = &pipeline.source {
        attributes.insert("pipeline.source".into(), json!(source));
    }
    if let Some(ref_) = &pipeline.ref_ {
        attributes.insert("pipeline.ref".into(), json!(ref_));
    }

    Span {
        trace_id: trace.to_string(),
        span_id: span_id(SpanKind::Pipeline, pipeline.id as u64),
        parent_span_id: parent.map(|bridge| span_id(SpanKind::Bridge, bridge.id as u64)),
        kind: SpanKind::Pipeline,
        name: format!("pipeline {}", pipeline.iid),
        start: pipeline.started_at.or(pipeline.created_at),
        end: pipeline.finished_at,
        attributes,
        links: Vec::new(),
    }
}

fn job_span(trace: &str, job: &Job) -> Span {
    let mut attributes = IndexMap::new();
    attributes.insert("job.status".into(), json!(job.status));
    if let Some(stage) = &job.stage {
        attributes.insert("job.stage".into(), json!(stage));
    }
    if let Some(runner) = job.runner_id {
        attributes.insert("runner.id".into(), json!(runner));
    }
    if job.allow_failure {
        attributes.insert("job.allow_failure".into(), json!(true));
    }

    Span {
        trace_id: trace.to_string(),
        span_id: span_id(SpanKind::Job, job.id as u64),
        parent_span_id: Some(span_id(SpanKind::Pipeline, job.pipeline_id as u64)),
        kind: SpanKind::Job,
        name: job.name.clone(),
        start: job.started_at,
        end: job.finished_at,
        attributes,
        links: Vec::new(),
    }
}

fn bridge_span(trace: &str, hierarchy: &PipelineHierarchy, bridge: &Bridge) -> Span {
    let mut attributes = IndexMap::new();
    attributes.insert("bridge.status".into(), json!(bridge.status));
    if let Some(stage) = &bridge.stage {
        attributes.insert("bridge.stage".into(), json!(stage));
    }

    Span {
        trace_id: trace.to_string(),
        span_id: span_id(SpanKind::Bridge, bridge.id as u64),
        parent_span_id: Some(span_id(SpanKind::Pipeline, bridge.pipeline_id as u64)),
        kind: SpanKind::Bridge,
        name: bridge.name.clone(),
        start: bridge.started_at.or(bridge.created_at),
        end: bridge.finished_at,
        attributes,
        links: bridge
            .downstream
            .iter()
            .map(|down| downstream_link(trace, hierarchy, down))
            .collect(),
    }
}

fn downstream_link(trace: &str, hierarchy: &PipelineHierarchy, down: &PipelineRef) -> SpanLink {
    let trace_id = if hierarchy.contains(down.id) {
        trace.to_string()
    } else {
        trace_id(down.id)
    };
    SpanLink {
        trace_id,
        span_id: span_id(SpanKind::Pipeline, down.id as u64),
    }
}

fn section_span(trace: &str, section: &JobSection) -> Span {
    let at = |secs: i64| Utc.timestamp_opt(secs, 0).single();

    Span {
        trace_id: trace.to_string(),
        span_id: section_span_id(section.job_id, section.index),
        parent_span_id: Some(span_id(SpanKind::Job, section.job_id as u64)),
        kind: SpanKind::Section,
        name: section.name.clone(),
        start: at(section.start),
        end: section.end.and_then(at),
        attributes: IndexMap::new(),
        links: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(id: i64, upstream: Option<i64>) -> Pipeline {
        Pipeline {
            id,
            iid: id.to_string(),
            project_id: 1,
            status: "success".into(),
            upstream: upstream.map(|id| PipelineRef {
                id,
                iid: id.to_string(),
                project_id: Some(2),
                project_path: "g/upstream".into(),
            }),
            ..Pipeline::default()
        }
    }

    fn bridge(id: i64, pipeline_id: i64, downstream: i64) -> Bridge {
        Bridge {
            id,
            pipeline_id,
            name: format!("trigger {downstream}"),
            downstream: Some(PipelineRef {
                id: downstream,
                iid: downstream.to_string(),
                project_id: Some(1),
                project_path: "g/app".into(),
            }),
            ..Bridge::default()
        }
    }

    fn hierarchy() -> PipelineHierarchy {
        let mut root = HierarchyEntry::new(pipeline(10, Some(5)));
        root.jobs.push(Job {
            id: 100,
            pipeline_id: 10,
            name: "build".into(),
            ..Job::default()
        });
        root.bridges.push(bridge(101, 10, 11));
        root.bridges.push(bridge(102, 10, 99));
        root.sections.push(JobSection {
            job_id: 100,
            pipeline_id: 10,
            project_id: 1,
            index: 0,
            name: "compile".into(),
            start: 1_700_000_000,
            end: None,
        });

        let mut h = PipelineHierarchy::new(root);
        h.attach(10, HierarchyEntry::new(pipeline(11, Some(10))));
        h
    }

    #[test]
    fn span_ids_carry_kind_tag() {
        assert_eq!(span_id(SpanKind::Pipeline, 10), "010000000000000a");
        assert_eq!(span_id(SpanKind::Bridge, 10), "030000000000000a");
        assert_ne!(section_span_id(1, 0), section_span_id(1, 1));
        assert_eq!(trace_id(255), format!("{}ff", "0".repeat(30)));
    }

    #[test]
    fn builds_parent_child_structure() {
        let data = TraceData::from_hierarchy(&hierarchy());
        let trace = trace_id(10);

        assert_eq!(data.pipelines.len(), 2);
        assert!(data.into_spans().iter().all(|span| span.trace_id == trace));

        let data = TraceData::from_hierarchy(&hierarchy());
        let root = &data.pipelines[0];
        assert!(root.parent_span_id.is_none());
        assert_eq!(root.links[0].span_id, span_id(SpanKind::Pipeline, 5));
        assert_eq!(root.links[0].trace_id, trace_id(5));

        let child = &data.pipelines[1];
        assert_eq!(
            child.parent_span_id.as_deref(),
            Some(span_id(SpanKind::Bridge, 101).as_str())
        );
        assert!(child.links.is_empty(), "child is linked through its parent");

        assert_eq!(
            data.jobs[0].parent_span_id,
            Some(span_id(SpanKind::Pipeline, 10))
        );
        assert_eq!(
            data.sections[0].parent_span_id,
            Some(span_id(SpanKind::Job, 100))
        );
        assert!(data.sections[0].end.is_none());
    }

    #[test]
    fn bridges_link_to_downstream_pipelines() {
        let data = TraceData::from_hierarchy(&hierarchy());
        let inside = &data.bridges[0].links[0];
        let outside = &data.bridges[1].links[0];

        assert_eq!(inside.trace_id, trace_id(10));
        assert_eq!(outside.trace_id, trace_id(99));
        assert_eq!(outside.span_id, span_id(SpanKind::Pipeline, 99));
        assert_eq!(data.len(), 6);
    }
}
