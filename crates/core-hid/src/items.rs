//! Report-descriptor walker.
//!
//! A descriptor is a stream of short items: a prefix byte carrying size,
//! type and tag, followed by 0/1/2/4 little-endian data bytes. Global items
//! (usage page, logical range, report size/count/id, push/pop) persist until
//! overwritten; local items (usages, usage ranges) apply to the next main
//! item only. The walker tracks a bit cursor per report ID across INPUT
//! items — including CONST padding — so every emitted field knows exactly
//! where its data sits inside a report.
//!
//! Variable INPUT items are split into one field per report element, each
//! consuming the next local usage (the declared range expands, the last
//! explicit usage repeats). Array items stay whole, carrying their element
//! count. Long items and the item types the interpreter has no use for
//! (output, feature, units, physical ranges) are skipped.

use bitflags::bitflags;
use std::collections::HashMap;
use thiserror::Error;

bitflags! {
    /// INPUT-item data bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ItemFlags: u32 {
        const CONST = 1 << 0;
        const VARIABLE = 1 << 1;
        const RELATIVE = 1 << 2;
        const WRAP = 1 << 3;
        const NONLINEAR = 1 << 4;
        const NO_PREFERRED = 1 << 5;
        const NULL_STATE = 1 << 6;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("descriptor item truncated at byte {offset}")]
    Truncated { offset: usize },
    #[error("logical range invalid: min {min} > max {max}")]
    InvalidRange { min: i32, max: i32 },
    #[error("pop without matching push at byte {offset}")]
    UnbalancedPop { offset: usize },
}

/// One INPUT field as laid out in a report. `usage` is the combined
/// `page << 16 | id` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputField {
    pub usage: u32,
    pub report_id: u8,
    pub flags: ItemFlags,
    pub bit_pos: u32,
    pub bit_len: u32,
    pub array_count: u32,
    pub logical_min: i32,
    pub logical_max: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportItem {
    Collection { usage: u32 },
    EndCollection,
    Input(InputField),
}

#[derive(Debug, Clone, Default)]
struct GlobalState {
    usage_page: u16,
    logical_min: i32,
    logical_max_signed: i32,
    logical_max_raw: u32,
    report_size: u32,
    report_count: u32,
    report_id: u8,
}

impl GlobalState {
    /// Resolve the logical range for a data item. Descriptors regularly
    /// encode an unsigned maximum (`0xFF` meaning 255) in a field that reads
    /// back negative; reinterpret it when the minimum says the range is
    /// non-negative.
    fn logical_range(&self) -> Result<(i32, i32), DescriptorError> {
        let min = self.logical_min;
        let mut max = self.logical_max_signed;
        if min >= 0 && max < min {
            max = self.logical_max_raw as i32;
        }
        if min > max {
            return Err(DescriptorError::InvalidRange { min, max });
        }
        Ok((min, max))
    }
}

#[derive(Default)]
struct LocalState {
    usages: Vec<u32>,
    usage_min: Option<u32>,
    usage_max: Option<u32>,
}

impl LocalState {
    /// Usage for the `i`-th element of a variable item: explicit usages in
    /// declaration order, then the declared range, then the last explicit
    /// usage repeating.
    fn usage_for(&self, i: usize) -> u32 {
        if let Some(&u) = self.usages.get(i) {
            return u;
        }
        if let (Some(lo), Some(hi)) = (self.usage_min, self.usage_max) {
            let idx = (i - self.usages.len()) as u32;
            return lo.saturating_add(idx).min(hi);
        }
        self.usages.last().copied().unwrap_or(0)
    }

    /// Usage representing an array item as a whole.
    fn array_usage(&self) -> u32 {
        self.usages
            .first()
            .copied()
            .or(self.usage_min)
            .unwrap_or(0)
    }
}

fn extend_usage(page: u16, data: u32, size: usize) -> u32 {
    if size == 4 {
        data
    } else {
        ((page as u32) << 16) | data
    }
}

fn sign_extend(data: u32, size: usize) -> i32 {
    match size {
        1 => data as u8 as i8 as i32,
        2 => data as u16 as i16 as i32,
        4 => data as i32,
        _ => 0,
    }
}

/// Walk the descriptor and return collections plus INPUT fields in
/// declaration order.
pub fn parse_input_items(descriptor: &[u8]) -> Result<Vec<ReportItem>, DescriptorError> {
    let mut out = Vec::new();
    let mut global = GlobalState::default();
    let mut stack: Vec<GlobalState> = Vec::new();
    let mut local = LocalState::default();
    // Input bit cursor per report ID; CONST padding advances it too.
    let mut cursors: HashMap<u8, u32> = HashMap::new();

    let mut i = 0usize;
    while i < descriptor.len() {
        let prefix = descriptor[i];
        if prefix == 0xFE {
            // Long item: prefix, data size, long tag, data. Nothing in it is
            // interpreted; skip it whole.
            let size = *descriptor
                .get(i + 1)
                .ok_or(DescriptorError::Truncated { offset: i })? as usize;
            let next = i + 3 + size;
            if next > descriptor.len() {
                return Err(DescriptorError::Truncated { offset: i });
            }
            i = next;
            continue;
        }
        let size = match prefix & 0x03 {
            0 => 0,
            1 => 1,
            2 => 2,
            _ => 4,
        };
        let item_type = (prefix >> 2) & 0x03;
        let tag = prefix >> 4;
        let data_bytes = descriptor
            .get(i + 1..i + 1 + size)
            .ok_or(DescriptorError::Truncated { offset: i })?;
        let mut udata: u32 = 0;
        for (n, &b) in data_bytes.iter().enumerate() {
            udata |= (b as u32) << (8 * n);
        }
        let sdata = sign_extend(udata, size);

        match item_type {
            0 => {
                // Main items.
                match tag {
                    8 => {
                        let flags = ItemFlags::from_bits_truncate(udata);
                        push_input(&mut out, &global, &local, &mut cursors, flags)?;
                    }
                    10 => out.push(ReportItem::Collection {
                        usage: local.usage_for(0),
                    }),
                    12 => out.push(ReportItem::EndCollection),
                    // Output and feature reports live in their own bit
                    // spaces, which the interpreter does not track.
                    _ => {}
                }
                local = LocalState::default();
            }
            1 => {
                // Global items.
                match tag {
                    0 => global.usage_page = udata as u16,
                    1 => global.logical_min = sdata,
                    2 => {
                        global.logical_max_signed = sdata;
                        global.logical_max_raw = udata;
                    }
                    7 => global.report_size = udata,
                    8 => global.report_id = udata as u8,
                    9 => global.report_count = udata,
                    10 => stack.push(global.clone()),
                    11 => {
                        global = stack
                            .pop()
                            .ok_or(DescriptorError::UnbalancedPop { offset: i })?;
                    }
                    _ => {}
                }
            }
            2 => {
                // Local items.
                match tag {
                    0 => local.usages.push(extend_usage(global.usage_page, udata, size)),
                    1 => local.usage_min = Some(extend_usage(global.usage_page, udata, size)),
                    2 => local.usage_max = Some(extend_usage(global.usage_page, udata, size)),
                    _ => {}
                }
            }
            _ => {}
        }
        i += 1 + size;
    }
    Ok(out)
}

fn push_input(
    out: &mut Vec<ReportItem>,
    global: &GlobalState,
    local: &LocalState,
    cursors: &mut HashMap<u8, u32>,
    flags: ItemFlags,
) -> Result<(), DescriptorError> {
    let bit_len = global.report_size;
    let count = global.report_count;
    let pos = cursors.entry(global.report_id).or_insert(0);
    if flags.contains(ItemFlags::CONST) {
        // Padding: keeps the cursor honest, carries no data.
        out.push(ReportItem::Input(InputField {
            usage: 0,
            report_id: global.report_id,
            flags,
            bit_pos: *pos,
            bit_len,
            array_count: count,
            logical_min: 0,
            logical_max: 0,
        }));
        *pos += bit_len * count;
        return Ok(());
    }
    let (logical_min, logical_max) = global.logical_range()?;
    if flags.contains(ItemFlags::VARIABLE) {
        for element in 0..count {
            out.push(ReportItem::Input(InputField {
                usage: local.usage_for(element as usize),
                report_id: global.report_id,
                flags,
                bit_pos: *pos,
                bit_len,
                array_count: 1,
                logical_min,
                logical_max,
            }));
            *pos += bit_len;
        }
    } else {
        out.push(ReportItem::Input(InputField {
            usage: local.array_usage(),
            report_id: global.report_id,
            flags,
            bit_pos: *pos,
            bit_len,
            array_count: count,
            logical_min,
            logical_max,
        }));
        *pos += bit_len * count;
    }
    Ok(())
}
