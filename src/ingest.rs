//! Ingest frame codec and the producer-side pool port.
//!
//! # Frame layout
//! ```text
//! offset  size  field
//! 0       4     antenna       u32 LE
//! 4       4     channel       u32 LE
//! 8       4     beam          u32 LE
//! 12      4     control_word  u32 LE
//! 16      4·N   N × (re: i16 LE, im: i16 LE)
//! ```
//!
//! `N` is the pool-wide `samples_per_buffer`, so every frame has the same
//! length. A frame of any other length is a transport error. A frame with
//! out-of-range indices decodes fine and is dropped by the pool.

use crate::error::{CorrError, CorrResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use corr_pool::{BufferHeader, FillOutcome, SampleBufferPool};
use num_complex::Complex;
use std::sync::Arc;
use tracing::trace;

/// Size of the frame header in bytes.
pub const HEADER_BYTES: usize = 16;

/// Size of one complex sample on the wire.
pub const SAMPLE_BYTES: usize = 4;

/// Frame length for `samples` complex samples.
#[must_use]
pub const fn frame_len(samples: usize) -> usize {
    HEADER_BYTES + SAMPLE_BYTES * samples
}

/// Decode the header of a frame.
pub fn decode_header(frame: &[u8]) -> CorrResult<BufferHeader> {
    if frame.len() < HEADER_BYTES {
        return Err(CorrError::Decode(format!(
            "frame of {} bytes is shorter than the {HEADER_BYTES}-byte header",
            frame.len()
        )));
    }
    let mut buf = &frame[..HEADER_BYTES];
    Ok(BufferHeader {
        antenna: buf.get_u32_le(),
        channel: buf.get_u32_le(),
        beam: buf.get_u32_le(),
        control_word: buf.get_u32_le(),
    })
}

/// Decode a whole frame into `samples`, whose length fixes the expected
/// frame size.
pub fn decode_into(frame: &[u8], samples: &mut [Complex<f32>]) -> CorrResult<BufferHeader> {
    let expected = frame_len(samples.len());
    if frame.len() != expected {
        return Err(CorrError::Decode(format!(
            "expected a {expected}-byte frame, got {} bytes",
            frame.len()
        )));
    }
    let header = decode_header(frame)?;
    let mut payload = &frame[HEADER_BYTES..];
    for sample in samples.iter_mut() {
        let re = payload.get_i16_le();
        let im = payload.get_i16_le();
        *sample = Complex::new(f32::from(re), f32::from(im));
    }
    Ok(header)
}

/// Encode a frame. Sample components are rounded and saturated to `i16`.
#[must_use]
pub fn encode_frame(header: &BufferHeader, samples: &[Complex<f32>]) -> Bytes {
    let mut buf = BytesMut::with_capacity(frame_len(samples.len()));
    buf.put_u32_le(header.antenna);
    buf.put_u32_le(header.channel);
    buf.put_u32_le(header.beam);
    buf.put_u32_le(header.control_word);
    for sample in samples {
        buf.put_i16_le(quantize(sample.re));
        buf.put_i16_le(quantize(sample.im));
    }
    buf.freeze()
}

fn quantize(x: f32) -> i16 {
    // float-to-int `as` saturates
    x.round() as i16
}

/// What happened to a delivered frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Published to the pool.
    Registered,
    /// No free buffer; the sample interval was dropped.
    Exhausted,
    /// Header indices out of range; the pool dropped the buffer.
    Malformed,
}

/// Producer handle onto the pool. Cheap to clone; one per ingest thread.
#[derive(Clone)]
pub struct IngestPort {
    pool: Arc<SampleBufferPool>,
}

impl IngestPort {
    /// Port onto `pool`.
    #[must_use]
    pub fn new(pool: Arc<SampleBufferPool>) -> Self {
        Self { pool }
    }

    /// Complex samples per frame.
    #[must_use]
    pub fn samples_per_buffer(&self) -> usize {
        self.pool.dimensions().samples_per_buffer
    }

    /// Buffers published but not yet matched.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pool.ready_entries()
    }

    /// Claim a buffer, decode `frame` into it, and publish it.
    ///
    /// A decode failure returns the claimed buffer to the pool and yields
    /// [`CorrError::Decode`].
    pub fn deliver(&self, frame: &[u8]) -> CorrResult<Delivery> {
        let Some(mut slot) = self.pool.get_buffer_to_fill() else {
            return Ok(Delivery::Exhausted);
        };
        let header = decode_into(frame, slot.samples_mut())?;
        trace!(
            buffer_id = slot.id(),
            antenna = header.antenna,
            channel = header.channel,
            beam = header.beam,
            "Frame decoded"
        );
        match self.pool.buffer_filled(slot, header)? {
            FillOutcome::Registered => Ok(Delivery::Registered),
            FillOutcome::Dropped => Ok(Delivery::Malformed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corr_pool::{BufferState, PoolDimensions};

    fn header(antenna: u32, channel: u32) -> BufferHeader {
        BufferHeader {
            antenna,
            channel,
            beam: 0,
            control_word: 0xBEEF,
        }
    }

    fn pool(capacity_per_key: usize) -> Arc<SampleBufferPool> {
        Arc::new(SampleBufferPool::new(PoolDimensions {
            antennas: 2,
            channels: 1,
            beams: 1,
            samples_per_buffer: 4,
            oversubscription: capacity_per_key,
        }))
    }

    #[test]
    fn test_frame_layout() {
        let samples = [Complex::new(1.4, -2.6), Complex::new(40000.0, -40000.0)];
        let frame = encode_frame(&header(3, 1), &samples);
        assert_eq!(frame.len(), frame_len(2));
        assert_eq!(&frame[..4], &[3, 0, 0, 0]);
        assert_eq!(&frame[12..16], &[0xEF, 0xBE, 0, 0]);

        let mut decoded = [Complex::new(0.0, 0.0); 2];
        let decoded_header = decode_into(&frame, &mut decoded).unwrap();
        assert_eq!(decoded_header, header(3, 1));
        assert_eq!(decoded[0], Complex::new(1.0, -3.0));
        assert_eq!(decoded[1], Complex::new(32767.0, -32768.0));
    }

    #[test]
    fn test_wrong_length_is_decode_error() {
        let frame = encode_frame(&header(0, 0), &[Complex::new(0.0, 0.0); 3]);
        let mut samples = [Complex::new(0.0, 0.0); 4];
        assert!(matches!(
            decode_into(&frame, &mut samples),
            Err(CorrError::Decode(_))
        ));
        assert!(decode_header(&frame[..10]).is_err());
    }

    #[test]
    fn test_deliver_registers_and_drops() {
        let pool = pool(1);
        let port = IngestPort::new(Arc::clone(&pool));
        let samples = [Complex::new(1.0, 1.0); 4];

        assert_eq!(
            port.deliver(&encode_frame(&header(0, 0), &samples)).unwrap(),
            Delivery::Registered
        );
        assert_eq!(
            port.deliver(&encode_frame(&header(1, 9), &samples)).unwrap(),
            Delivery::Malformed
        );
        assert_eq!(pool.state_counts().ready, 1);
        assert_eq!(pool.state_counts().free, 1);

        assert_eq!(
            port.deliver(&encode_frame(&header(1, 0), &samples)).unwrap(),
            Delivery::Registered
        );
        assert_eq!(
            port.deliver(&encode_frame(&header(1, 0), &samples)).unwrap(),
            Delivery::Exhausted
        );
    }

    #[test]
    fn test_decode_failure_returns_buffer() {
        let pool = pool(1);
        let port = IngestPort::new(Arc::clone(&pool));
        assert!(port.deliver(&[0u8; 7]).is_err());
        assert_eq!(pool.state_counts().free, pool.capacity());
        assert!((0..pool.capacity()).all(|id| pool.state(id) == Ok(BufferState::Free)));
    }
}
