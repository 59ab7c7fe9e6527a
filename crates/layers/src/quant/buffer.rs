use crate::{LayerError, Result};

use super::Lane;

/// Owned, vector-aligned storage for quantized samples.
///
/// The buffer is resized between forward calls as batch sizes change. Growth
/// goes through a fallible reservation so an allocation failure surfaces as
/// [`LayerError::Allocation`] and leaves the previous contents untouched.
#[derive(Debug, Default, Clone)]
pub struct LaneBuffer {
    lanes: Vec<Lane>,
}

impl LaneBuffer {
    /// Allocates a zeroed buffer holding `lanes` lanes.
    pub fn with_lanes(lanes: usize) -> Result<Self> {
        let mut buffer = Self::default();
        buffer.resize(lanes)?;
        Ok(buffer)
    }

    /// Resizes the buffer to exactly `lanes` lanes, reusing capacity when possible.
    pub fn resize(&mut self, lanes: usize) -> Result<()> {
        if lanes > self.lanes.capacity() {
            self.lanes
                .try_reserve_exact(lanes - self.lanes.len())
                .map_err(|_| LayerError::Allocation {
                    context: "quantized lanes",
                    elements: lanes,
                })?;
        }
        self.lanes.resize(lanes, Lane::default());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    pub fn as_slice(&self) -> &[Lane] {
        &self.lanes
    }

    pub fn as_mut_slice(&mut self) -> &mut [Lane] {
        &mut self.lanes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_reuses_capacity_when_shrinking() -> anyhow::Result<()> {
        let mut buffer = LaneBuffer::with_lanes(32)?;
        let before = buffer.as_slice().as_ptr();
        buffer.resize(4)?;
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.as_slice().as_ptr(), before);
        Ok(())
    }

    #[test]
    fn data_pointer_is_lane_aligned() -> anyhow::Result<()> {
        let buffer = LaneBuffer::with_lanes(3)?;
        assert_eq!(buffer.as_slice().as_ptr() as usize % 16, 0);
        Ok(())
    }

    #[test]
    fn impossible_request_reports_allocation_error() -> anyhow::Result<()> {
        let mut buffer = LaneBuffer::with_lanes(2)?;
        let err = buffer.resize(usize::MAX / 8).unwrap_err();
        assert!(matches!(err, LayerError::Allocation { .. }));
        assert_eq!(buffer.len(), 2);
        Ok(())
    }
}
