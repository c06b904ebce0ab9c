//! Stop-condition detection over the growing token buffer

/// Outcome of a stop check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StopCondition {
    pub stop_met: bool,
    /// Trailing tokens belonging to the matched stop sequence
    pub trim_length: usize,
}

impl StopCondition {
    const CONTINUE: Self = Self { stop_met: false, trim_length: 0 };

    fn stop(trim_length: usize) -> Self {
        Self { stop_met: true, trim_length }
    }
}

/// Decide whether generation must halt.
///
/// An eos token at the end stops with nothing to trim. Otherwise stop sequences
/// are tried in the order given and the first exact suffix match wins, even when
/// a longer sequence later in the list would also match.
pub fn stopping_criteria(tokens: &[u32], stop_id_sequences: &[Vec<u32>], eos_token_ids: &[u32]) -> StopCondition {
    let Some(last) = tokens.last() else {
        return StopCondition::CONTINUE;
    };
    if eos_token_ids.contains(last) {
        return StopCondition::stop(0);
    }

    for stop_ids in stop_id_sequences {
        if stop_ids.is_empty() || tokens.len() < stop_ids.len() {
            continue;
        }
        if tokens.ends_with(stop_ids) {
            return StopCondition::stop(stop_ids.len());
        }
    }

    StopCondition::CONTINUE
}

/// Stop sequences and eos ids bound for one generation
#[derive(Debug, Clone, Default)]
pub struct StopMatcher {
    stop_id_sequences: Vec<Vec<u32>>,
    eos_token_ids: Vec<u32>,
}

impl StopMatcher {
    pub fn new(stop_id_sequences: Vec<Vec<u32>>, eos_token_ids: Vec<u32>) -> Self {
        Self {
            stop_id_sequences,
            eos_token_ids,
        }
    }

    pub fn check(&self, tokens: &[u32]) -> StopCondition {
        stopping_criteria(tokens, &self.stop_id_sequences, &self.eos_token_ids)
    }

    pub fn is_eos(&self, token: u32) -> bool {
        self.eos_token_ids.contains(&token)
    }
}
