//! Progressive (`stbl`) sample tables.

use std::collections::HashSet;

use crate::error::DemuxError;
use crate::mp4_box::{kind, Mp4Box};

use super::RawSample;

/// Legacy sample tables of one track, as stored in `stbl`.
#[derive(Debug, Default)]
pub(super) struct SampleTable {
    /// (sample_count, sample_delta)
    time_to_sample: Vec<(u32, u32)>,
    /// (first_chunk, samples_per_chunk)
    sample_to_chunk: Vec<(u32, u32)>,
    sample_sizes: Vec<u32>,
    chunk_offsets: Vec<u64>,
    /// 1-based sample numbers. `None` when `stss` is absent: every sample syncs.
    sync_samples: Option<HashSet<u32>>,
}

impl SampleTable {
    pub(super) fn parse(stbl: &Mp4Box<'_>, file_len: u64) -> Result<Self, DemuxError> {
        let mut table = Self::default();

        for item in stbl.children() {
            let b = item?;
            match b.kind {
                kind::STTS => {
                    let (_, _, mut r) = b.full_box()?;
                    let count = r.u32()?;
                    table.time_to_sample.reserve(r.capacity_for(count, 8));
                    for _ in 0..count {
                        table.time_to_sample.push((r.u32()?, r.u32()?));
                    }
                }
                kind::STSC => {
                    let (_, _, mut r) = b.full_box()?;
                    let count = r.u32()?;
                    table.sample_to_chunk.reserve(r.capacity_for(count, 12));
                    for _ in 0..count {
                        let first_chunk = r.u32()?;
                        let samples_per_chunk = r.u32()?;
                        r.skip(4)?; // sample_description_index
                        if first_chunk == 0 {
                            return Err(DemuxError::format("stsc entry references chunk 0"));
                        }
                        table.sample_to_chunk.push((first_chunk, samples_per_chunk));
                    }
                }
                kind::STSZ => {
                    let (_, _, mut r) = b.full_box()?;
                    let sample_size = r.u32()?;
                    let count = r.u32()?;
                    if sample_size == 0 {
                        table.sample_sizes.reserve(r.capacity_for(count, 4));
                        for _ in 0..count {
                            table.sample_sizes.push(r.u32()?);
                        }
                    } else {
                        if u64::from(sample_size) * u64::from(count) > file_len {
                            return Err(DemuxError::format(format!(
                                "stsz declares {count} samples of {sample_size} bytes, more than the file holds"
                            )));
                        }
                        table.sample_sizes = vec![sample_size; count as usize];
                    }
                }
                kind::STCO => {
                    let (_, _, mut r) = b.full_box()?;
                    let count = r.u32()?;
                    table.chunk_offsets.reserve(r.capacity_for(count, 4));
                    for _ in 0..count {
                        table.chunk_offsets.push(u64::from(r.u32()?));
                    }
                }
                kind::CO64 => {
                    let (_, _, mut r) = b.full_box()?;
                    let count = r.u32()?;
                    table.chunk_offsets.reserve(r.capacity_for(count, 8));
                    for _ in 0..count {
                        table.chunk_offsets.push(r.u64()?);
                    }
                }
                kind::STSS => {
                    let (_, _, mut r) = b.full_box()?;
                    let count = r.u32()?;
                    let mut set = HashSet::with_capacity(r.capacity_for(count, 4));
                    for _ in 0..count {
                        set.insert(r.u32()?);
                    }
                    table.sync_samples = Some(set);
                }
                _ => {}
            }
        }

        Ok(table)
    }

    pub(super) fn sample_count(&self) -> usize {
        self.sample_sizes.len()
    }

    /// Resolve every sample's file offset, timing and sync flag, in
    /// decode order.
    pub(super) fn resolve(&self) -> Result<Vec<RawSample>, DemuxError> {
        let total = self.sample_count();
        if total == 0 {
            return Ok(Vec::new());
        }
        if self.chunk_offsets.is_empty() || self.sample_to_chunk.is_empty() {
            return Err(DemuxError::format(format!(
                "stsz declares {total} samples but the chunk tables are empty"
            )));
        }

        let timing = self.expand_time_to_sample(total)?;
        let mut samples = Vec::with_capacity(total);
        let chunk_count = self.chunk_offsets.len() as u64;

        'entries: for (i, &(first_chunk, samples_per_chunk)) in
            self.sample_to_chunk.iter().enumerate()
        {
            let next_first = self
                .sample_to_chunk
                .get(i + 1)
                .map(|&(c, _)| u64::from(c))
                .unwrap_or(chunk_count + 1);

            for chunk in u64::from(first_chunk)..next_first {
                let Some(&chunk_offset) = self.chunk_offsets.get((chunk - 1) as usize) else {
                    return Err(DemuxError::format(format!(
                        "stsc references chunk {chunk} but only {chunk_count} chunks exist"
                    )));
                };

                // in-chunk offset = sum of prior sizes in the same chunk
                let mut offset = chunk_offset;
                for _ in 0..samples_per_chunk {
                    let index = samples.len();
                    if index >= total {
                        break 'entries;
                    }
                    let size = self.sample_sizes[index];
                    let (decode_time, duration) = timing[index];
                    let number = index as u32 + 1;
                    samples.push(RawSample {
                        offset,
                        size,
                        decode_time,
                        duration,
                        is_sync: self
                            .sync_samples
                            .as_ref()
                            .map_or(true, |set| set.contains(&number)),
                    });
                    offset = offset.checked_add(u64::from(size)).ok_or_else(|| {
                        DemuxError::format(format!(
                            "chunk {chunk} at offset {chunk_offset} overflows the file offset range"
                        ))
                    })?;
                }
            }
        }

        if samples.len() < total {
            return Err(DemuxError::format(format!(
                "sample-to-chunk table places {} of {total} samples",
                samples.len()
            )));
        }
        Ok(samples)
    }

    /// (decode_time, duration) for each of the first `total` samples.
    fn expand_time_to_sample(&self, total: usize) -> Result<Vec<(u64, u32)>, DemuxError> {
        let mut timing = Vec::with_capacity(total);
        let mut time = 0u64;

        'entries: for &(count, delta) in &self.time_to_sample {
            for _ in 0..count {
                if timing.len() == total {
                    break 'entries;
                }
                timing.push((time, delta));
                time = time
                    .checked_add(u64::from(delta))
                    .ok_or_else(|| DemuxError::format("stts decode time overflows"))?;
            }
        }

        if timing.len() < total {
            return Err(DemuxError::format(format!(
                "stts covers {} samples but stsz declares {total}",
                timing.len()
            )));
        }
        Ok(timing)
    }
}
