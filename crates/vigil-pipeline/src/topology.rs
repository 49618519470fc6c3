//! Topology descriptions: the textual grammar and the descriptor set it
//! parses into.
//!
//! Grammar, by example:
//!
//! ```text
//! detect ! track ! classify
//! detect ! track name=t ! t.classify ! t.reid
//! ```
//!
//! Stages are separated by `!`.  A stage may declare `name=X`; a later
//! `X.kind` token attaches as a child of the named stage instead of the
//! linear predecessor.  A token whose successor would be the end of the
//! description (or the start of another sub-branch) becomes a terminal
//! branch, wired to the implicit sink's next input slot, assigned
//! left-to-right.

use serde::Serialize;

use vigil_core::{PipelineError, Result};

use crate::kinds::StageRegistry;

/// Upper bound on `!`-separated tokens in one description.  Overflow text
/// stays attached to the last token and fails kind resolution.
pub const MAX_STAGE_TOKENS: usize = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Predecessor {
    /// The pipeline entry point.  Exactly one node carries this.
    Source,
    Stage(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessorRef {
    Stage(usize),
    /// Terminal branch feeding the k-th sink input slot.
    SinkSlot(usize),
}

/// One node of the static stage graph.
#[derive(Clone, Debug, Serialize)]
pub struct StageDescriptor {
    pub id: usize,
    /// Kind name resolved through the registry at build time.
    pub kind: String,
    /// Branch-point name declared with `name=`.
    pub name: Option<String>,
    pub predecessor: Predecessor,
    pub successors: Vec<SuccessorRef>,
}

impl StageDescriptor {
    /// Name used for settings lookup and logging: the declared branch name,
    /// falling back to the kind.
    pub fn instance_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.kind)
    }
}

struct RawToken {
    kind: String,
    name: Option<String>,
    parent: Option<String>,
}

/// Parse a textual description into a validated descriptor set.
pub fn parse_description(desc: &str, registry: &StageRegistry) -> Result<Vec<StageDescriptor>> {
    let trimmed = desc.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::Topology("empty description".into()));
    }

    let tokens: Vec<&str> = trimmed
        .splitn(MAX_STAGE_TOKENS, '!')
        .map(str::trim)
        .collect();

    let mut raw = Vec::with_capacity(tokens.len());
    for &token in &tokens {
        if token.is_empty() {
            return Err(PipelineError::Topology(format!(
                "empty stage token in `{trimmed}`"
            )));
        }
        let (body, name) = match token.find("name=") {
            Some(at) => {
                let name = token[at + 5..].trim();
                if name.is_empty() {
                    return Err(PipelineError::Topology(format!(
                        "empty stage name in `{token}`"
                    )));
                }
                (token[..at].trim(), Some(name.to_string()))
            }
            None => (token, None),
        };
        let (kind, parent) = match body.find('.') {
            Some(dot) => (
                body[dot + 1..].trim().to_string(),
                Some(body[..dot].trim().to_string()),
            ),
            None => (body.to_string(), None),
        };
        if !registry.contains(&kind) {
            return Err(PipelineError::UnknownStageKind(kind));
        }
        raw.push(RawToken { kind, name, parent });
    }

    // Duplicate branch names make `X.` references ambiguous.
    for (i, token) in raw.iter().enumerate() {
        if let Some(name) = &token.name
            && raw[i + 1..].iter().any(|other| other.name.as_ref() == Some(name))
        {
            return Err(PipelineError::Topology(format!(
                "duplicate stage name `{name}`"
            )));
        }
    }

    let find_named = |name: &str| raw.iter().position(|token| token.name.as_deref() == Some(name));

    let mut descriptors = Vec::with_capacity(raw.len());
    let mut sink_slot = 0usize;
    for (i, token) in raw.iter().enumerate() {
        let predecessor = match &token.parent {
            Some(parent) => {
                let at = find_named(parent).ok_or_else(|| {
                    PipelineError::Topology(format!(
                        "branch `{parent}.{}` references undeclared stage name `{parent}`",
                        token.kind
                    ))
                })?;
                Predecessor::Stage(at)
            }
            None if i == 0 => Predecessor::Source,
            None => Predecessor::Stage(i - 1),
        };

        let branch_children: Vec<usize> = match &token.name {
            Some(name) => {
                let prefix = format!("{name}.");
                tokens
                    .iter()
                    .enumerate()
                    .filter(|(j, t)| *j != i && t.starts_with(&prefix))
                    .map(|(j, _)| j)
                    .collect()
            }
            None => Vec::new(),
        };

        let successors = if branch_children.is_empty() {
            // Linear rule: next token, unless it opens a sub-branch or this
            // is the last token — then this branch terminates at the sink.
            let terminal = i + 1 == raw.len() || raw[i + 1].parent.is_some();
            if terminal {
                let slot = sink_slot;
                sink_slot += 1;
                vec![SuccessorRef::SinkSlot(slot)]
            } else {
                vec![SuccessorRef::Stage(i + 1)]
            }
        } else {
            branch_children.into_iter().map(SuccessorRef::Stage).collect()
        };

        descriptors.push(StageDescriptor {
            id: i,
            kind: token.kind.clone(),
            name: token.name.clone(),
            predecessor,
            successors,
        });
    }

    validate_descriptors(&descriptors)?;
    Ok(descriptors)
}

/// Structural validation shared by the parser and static-array input.
pub fn validate_descriptors(descriptors: &[StageDescriptor]) -> Result<()> {
    if descriptors.is_empty() {
        return Err(PipelineError::Topology("no stages".into()));
    }

    let sources = descriptors
        .iter()
        .filter(|d| d.predecessor == Predecessor::Source)
        .count();
    if sources != 1 {
        return Err(PipelineError::Topology(format!(
            "expected exactly one source stage, found {sources}"
        )));
    }

    for (i, descriptor) in descriptors.iter().enumerate() {
        if descriptor.id != i {
            return Err(PipelineError::Topology(format!(
                "descriptor id {} out of order at position {i}",
                descriptor.id
            )));
        }
        if let Predecessor::Stage(p) = descriptor.predecessor
            && p >= descriptors.len()
        {
            return Err(PipelineError::Topology(format!(
                "stage {i} references missing predecessor {p}"
            )));
        }
        for successor in &descriptor.successors {
            if let SuccessorRef::Stage(s) = successor
                && *s >= descriptors.len()
            {
                return Err(PipelineError::Topology(format!(
                    "stage {i} references missing successor {s}"
                )));
            }
        }
    }
    Ok(())
}

/// Number of sink input slots a descriptor set terminates into.
pub fn sink_fan_in(descriptors: &[StageDescriptor]) -> usize {
    descriptors
        .iter()
        .flat_map(|d| d.successors.iter())
        .filter(|s| matches!(s, SuccessorRef::SinkSlot(_)))
        .count()
}

/// Entry node index (the single `Source` stage).
pub fn entry_index(descriptors: &[StageDescriptor]) -> Result<usize> {
    descriptors
        .iter()
        .position(|d| d.predecessor == Predecessor::Source)
        .ok_or_else(|| PipelineError::Topology("no source stage".into()))
}

/// Human-readable chain summary for the construction log.
pub fn chain_summary(descriptors: &[StageDescriptor]) -> String {
    let mut names: Vec<&str> = descriptors.iter().map(|d| d.instance_name()).collect();
    names.push("sink");
    names.join(" -> ")
}
