use std::collections::VecDeque;
use std::fmt::{Display, Formatter};

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::delivery::delivery_error::DeliveryError;
use crate::messaging::stream_message::{MessageId, MessageRef, SequenceKey};


pub const DEFAULT_MAX_GAP_COUNT: usize = 10_000;

/// NB: The derived order puts every finite bound before `Infinity`
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Debug)]
enum UpperBound {
    Finite(MessageRef),
    Infinity,
}

impl Display for UpperBound {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            UpperBound::Finite(r) => write!(f, "{}", r),
            UpperBound::Infinity => write!(f, "Infinity|Infinity"),
        }
    }
}

/// A range of message references that contains at least one message that was not seen yet.
///  The lower bound itself was seen, the upper bound was not.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
struct Gap {
    lower: MessageRef,
    upper: UpperBound,
}

impl Display for Gap {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}]", self.lower, self.upper)
    }
}

/// Detects duplicates (and inconsistencies) in a single chain of messages, based on each
///  message's own reference and its predecessor's reference.
///
/// Rather than remembering every message that was seen, the detector tracks the *gaps*, i.e. the
///  ranges of references that may still contain unseen messages. Gaps are sorted and disjoint,
///  and the last gap is always open-ended. Everything outside of gaps was seen.
///
/// The number of gaps is bounded: when there are more than `max_gap_count`, the lowest gap is
///  dropped, i.e. messages in that range are treated as seen from then on.
#[derive(Debug)]
pub struct DuplicateMessageDetector {
    max_gap_count: usize,
    gaps: VecDeque<Gap>,
}

impl Default for DuplicateMessageDetector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_GAP_COUNT)
    }
}

impl DuplicateMessageDetector {
    pub fn new(max_gap_count: usize) -> DuplicateMessageDetector {
        DuplicateMessageDetector {
            max_gap_count,
            gaps: VecDeque::new(),
        }
    }

    /// Marks a message as seen, returning `true` if it is new and `false` if it is a duplicate (or
    ///  otherwise already covered).
    ///
    /// Without a previous reference, the message is only compared to the open-ended last gap:
    ///  anything beyond its lower bound is new and advances it, everything else is considered a
    ///  duplicate even if it falls into an older gap.
    pub fn mark_and_check(&mut self, previous: Option<MessageRef>, current: MessageRef) -> Result<bool, DeliveryError> {
        if let Some(previous) = previous {
            if previous >= current {
                return Err(DeliveryError::InvalidOrdering { previous, current });
            }
        }

        if self.gaps.is_empty() {
            self.gaps.push_back(Gap {
                lower: current,
                upper: UpperBound::Infinity,
            });
            return Ok(true);
        }

        let previous = match previous {
            Some(previous) => previous,
            None => {
                // non-empty, checked above
                let Some(last_gap) = self.gaps.back_mut() else {
                    return Ok(false);
                };
                if current > last_gap.lower {
                    last_gap.lower = current;
                    return Ok(true);
                }
                return Ok(false);
            }
        };

        for i in (0..self.gaps.len()).rev() {
            let Gap { lower, upper } = self.gaps[i];

            if UpperBound::Finite(previous) >= upper {
                // if the message reached into the gap above, that gap would have matched
                return Ok(false);
            }

            if previous >= lower {
                if UpperBound::Finite(current) > upper {
                    return Err(self.gap_mismatch(previous, current));
                }

                let previous_is_lower = previous == lower;
                let current_is_upper = UpperBound::Finite(current) == upper;

                match (previous_is_lower, current_is_upper) {
                    (true, true) => {
                        let _ = self.gaps.remove(i);
                    }
                    (true, false) => {
                        self.gaps[i].lower = current;
                    }
                    (false, true) => {
                        self.gaps[i].upper = UpperBound::Finite(previous);
                    }
                    (false, false) => {
                        self.gaps[i].upper = UpperBound::Finite(previous);
                        self.gaps.insert(i + 1, Gap {
                            lower: current,
                            upper,
                        });
                    }
                }

                self.drop_lowest_gap_if_over_max_gap_count();
                return Ok(true);
            }

            if current > lower {
                return Err(self.gap_mismatch(previous, current));
            }
        }

        Ok(false)
    }

    fn gap_mismatch(&self, previous: MessageRef, current: MessageRef) -> DeliveryError {
        DeliveryError::GapMismatch {
            gaps: self.to_string(),
            previous,
            current,
        }
    }

    fn drop_lowest_gap_if_over_max_gap_count(&mut self) {
        if self.gaps.len() > self.max_gap_count {
            if let Some(dropped) = self.gaps.pop_front() {
                trace!(%dropped, "too many gaps: dropping lowest gap");
            }
        }
    }
}

impl Display for DuplicateMessageDetector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for gap in &self.gaps {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{}", gap)?;
        }
        Ok(())
    }
}


/// One detector per message chain, created on first use
#[derive(Debug)]
pub struct DuplicateDetectors {
    max_gap_count: usize,
    detectors: FxHashMap<SequenceKey, DuplicateMessageDetector>,
}

impl DuplicateDetectors {
    pub fn new(max_gap_count: usize) -> DuplicateDetectors {
        DuplicateDetectors {
            max_gap_count,
            detectors: Default::default(),
        }
    }

    pub fn mark_and_check(&mut self, message_id: &MessageId, previous: Option<MessageRef>) -> Result<bool, DeliveryError> {
        let max_gap_count = self.max_gap_count;
        let is_new = self.detectors.entry(message_id.sequence_key())
            .or_insert_with(|| DuplicateMessageDetector::new(max_gap_count))
            .mark_and_check(previous, message_id.message_ref)?;

        trace!(publisher = %message_id.publisher_id, chain = %message_id.message_chain_id, message = %message_id.message_ref, is_new, "checked for duplicate");
        Ok(is_new)
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }
}
