//! Report decoding: bit extraction, change detection and event translation.

use std::sync::Arc;

use core_events::{EventSink, HidEvent, HidEventKind};
use tracing::{debug, trace};

use crate::fields::{Field, FieldKind, Prev, build_field_table};
use crate::items::{DescriptorError, parse_input_items};
use crate::usages::usage_id;

/// One connected HID device: its classified field table plus the sink its
/// events go to. The table is immutable after construction; only the
/// per-field previous values change while reports are parsed.
pub struct Device {
    device_id: u32,
    fields: Vec<Field>,
    sink: Arc<dyn EventSink>,
}

impl Device {
    /// Digest a raw report descriptor. A malformed descriptor fails here;
    /// there is nothing useful to do with reports from a device we cannot
    /// lay out.
    pub fn from_descriptor(
        descriptor: &[u8],
        device_id: u32,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, DescriptorError> {
        let items = parse_input_items(descriptor)?;
        let fields = build_field_table(&items);
        debug!(
            target: "hid.parse",
            device_id,
            fields = fields.len(),
            "device table built"
        );
        Ok(Self {
            device_id,
            fields,
            sink,
        })
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Decode one input report, emitting events for every observed change in
    /// field-declaration order.
    ///
    /// A report shorter than the descriptor promised is extracted
    /// best-effort: bytes past its end read as zero.
    pub fn parse_report(&mut self, report: &[u8], report_id: u8) {
        // The two mouse axes combine into a single motion event; X stashes
        // its value until the matching Y field comes by.
        let mut mouse_x = 0i32;
        let mut mouse_changed = false;
        for i in 0..self.fields.len() {
            if self.fields[i].report_id != report_id {
                continue;
            }
            match self.fields[i].kind {
                FieldKind::MouseAxisX => {
                    let data = field_bits(report, &self.fields[i], 0);
                    if self.prev_scalar(i) != data as u32 {
                        mouse_changed = true;
                    }
                    mouse_x = data;
                    self.fields[i].prev = Prev::Scalar(data as u32);
                }
                FieldKind::MouseAxisY => {
                    let data = field_bits(report, &self.fields[i], 0);
                    if self.prev_scalar(i) != data as u32 {
                        mouse_changed = true;
                    }
                    if mouse_changed {
                        self.emit(
                            self.fields[i].ordinal,
                            HidEventKind::MouseMotion {
                                dx: mouse_x,
                                dy: data,
                            },
                        );
                        mouse_changed = false;
                    }
                    self.fields[i].prev = Prev::Scalar(data as u32);
                }
                FieldKind::Key => self.diff_key_array(report, i),
                _ => {
                    let data = field_bits(report, &self.fields[i], 0);
                    if self.prev_scalar(i) != data as u32 {
                        self.emit_change(i, data);
                        self.fields[i].prev = Prev::Scalar(data as u32);
                    }
                }
            }
        }
    }

    fn prev_scalar(&self, i: usize) -> u32 {
        match self.fields[i].prev {
            Prev::Scalar(v) => v,
            // Kinds handled scalar-wise never carry a vector.
            Prev::Vector(_) => 0,
        }
    }

    /// Key arrays carry the set of currently held key codes; a code present
    /// now but not before was pressed, one present before but gone now was
    /// released. Emitted per element in declaration order.
    fn diff_key_array(&mut self, report: &[u8], i: usize) {
        let n = (self.fields[i].array_count.max(1)) as usize;
        let new: Vec<u32> = (0..n)
            .map(|j| field_bits(report, &self.fields[i], j as u32) as u32)
            .collect();
        let old: Vec<u32> = match &self.fields[i].prev {
            Prev::Vector(v) => v.to_vec(),
            Prev::Scalar(s) => vec![*s],
        };
        let ordinal = self.fields[i].ordinal;
        for j in 0..n {
            let code = new[j];
            if code != 0 && !old.contains(&code) {
                self.emit(ordinal, HidEventKind::KeyDown { keycode: code });
            }
            let gone = old[j];
            if gone != 0 && !new.contains(&gone) {
                self.emit(ordinal, HidEventKind::KeyUp { keycode: gone });
            }
        }
        self.fields[i].prev = if n > 1 {
            Prev::Vector(new.into_boxed_slice())
        } else {
            Prev::Scalar(new[0])
        };
    }

    /// Translate a changed scalar field into its event.
    fn emit_change(&self, i: usize, data: i32) {
        let field = &self.fields[i];
        let kind = match field.kind {
            FieldKind::KeyMod => {
                let keycode = usage_id(field.usage) as u32;
                if data != 0 {
                    HidEventKind::KeyDown { keycode }
                } else {
                    HidEventKind::KeyUp { keycode }
                }
            }
            FieldKind::JoyButton => {
                if data != 0 {
                    HidEventKind::JoyButtonDown
                } else {
                    HidEventKind::JoyButtonUp
                }
            }
            FieldKind::MouseButton => {
                if data != 0 {
                    HidEventKind::MouseButtonDown
                } else {
                    HidEventKind::MouseButtonUp
                }
            }
            FieldKind::JoyAxis => HidEventKind::JoyAxis {
                pos: normalize_axis(data, field.logical_min, field.logical_max),
            },
            FieldKind::JoyHat => HidEventKind::JoyHat { pos: data },
            FieldKind::MouseWheel => HidEventKind::MouseWheel { delta: data },
            // Mouse axes and key arrays are handled by their own paths.
            FieldKind::MouseAxisX | FieldKind::MouseAxisY | FieldKind::Key => return,
        };
        self.emit(field.ordinal, kind);
    }

    fn emit(&self, ordinal: u32, kind: HidEventKind) {
        let event = HidEvent {
            device_id: self.device_id,
            ordinal,
            kind,
        };
        trace!(target: "hid.parse", ?event, "emit");
        self.sink.deliver(event);
    }
}

/// Map a value in `[min, max]` onto the signed 16-bit axis range.
fn normalize_axis(data: i32, min: i32, max: i32) -> i32 {
    let span = max as i64 - min as i64 + 1;
    (((data as i64 - min as i64) * 65536) / span - 32768) as i32
}

/// Pull one element of a field out of raw report bytes: accumulate the
/// spanned bytes little-endian, shift down to the start bit and mask to the
/// field width. Sign-extends when the descriptor declared a signed range.
/// Bytes past the end of the report read as zero.
fn field_bits(report: &[u8], field: &Field, index: u32) -> i32 {
    let mut len = field.bit_len as usize;
    if len == 0 {
        return 0;
    }
    if len > 32 {
        len = 32;
    }
    let start = (field.bit_pos + field.bit_len * index) as usize;
    let first = start / 8;
    let extra = (start + len) / 8 - first;
    let mut data: u64 = 0;
    for n in 0..=extra {
        data |= (report.get(first + n).copied().unwrap_or(0) as u64) << (8 * n);
    }
    data >>= start % 8;
    let shift = 32 - len;
    if field.logical_min < 0 || field.logical_max < 0 {
        ((data as u32) << shift) as i32 >> shift
    } else {
        (((data as u32) << shift) >> shift) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testdesc::{BOOT_KEYBOARD, GAMEPAD, WHEEL_MOUSE};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectSink {
        events: Mutex<Vec<HidEvent>>,
    }

    impl EventSink for CollectSink {
        fn deliver(&self, event: HidEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl CollectSink {
        fn take(&self) -> Vec<HidEvent> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    fn device(descriptor: &[u8]) -> (Device, Arc<CollectSink>) {
        let sink = Arc::new(CollectSink::default());
        let dev = Device::from_descriptor(descriptor, 7, sink.clone()).unwrap();
        (dev, sink)
    }

    fn kinds(events: &[HidEvent]) -> Vec<HidEventKind> {
        events.iter().map(|e| e.kind).collect()
    }

    #[test]
    fn keyboard_rollover_diff() {
        let (mut dev, sink) = device(BOOT_KEYBOARD);
        dev.parse_report(&[0, 0, 0, 0, 0, 0, 0, 0], 0);
        assert!(sink.take().is_empty());
        dev.parse_report(&[0, 0, 4, 5, 0, 0, 0, 0], 0);
        assert_eq!(
            kinds(&sink.take()),
            vec![
                HidEventKind::KeyDown { keycode: 4 },
                HidEventKind::KeyDown { keycode: 5 },
            ]
        );
        dev.parse_report(&[0, 0, 5, 0, 0, 0, 0, 0], 0);
        assert_eq!(
            kinds(&sink.take()),
            vec![HidEventKind::KeyUp { keycode: 4 }]
        );
        dev.parse_report(&[0, 0, 0, 0, 0, 0, 0, 0], 0);
        assert_eq!(
            kinds(&sink.take()),
            vec![HidEventKind::KeyUp { keycode: 5 }]
        );
    }

    #[test]
    fn rollover_is_position_independent() {
        let (mut dev, sink) = device(BOOT_KEYBOARD);
        dev.parse_report(&[0, 0, 10, 11, 12, 0, 0, 0], 0);
        sink.take();
        // Same set, shuffled positions: no transitions.
        dev.parse_report(&[0, 0, 12, 10, 11, 0, 0, 0], 0);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn modifier_bits_translate_to_usage_keycodes() {
        let (mut dev, sink) = device(BOOT_KEYBOARD);
        // Bit 1 = LeftShift (usage 0xE1).
        dev.parse_report(&[0b0000_0010, 0, 0, 0, 0, 0, 0, 0], 0);
        let events = sink.take();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, HidEventKind::KeyDown { keycode: 0xE1 });
        assert_eq!(events[0].ordinal, 1);
        dev.parse_report(&[0, 0, 0, 0, 0, 0, 0, 0], 0);
        assert_eq!(
            kinds(&sink.take()),
            vec![HidEventKind::KeyUp { keycode: 0xE1 }]
        );
    }

    #[test]
    fn mouse_motion_merges_axes_into_one_event() {
        let (mut dev, sink) = device(WHEEL_MOUSE);
        // X = +3, Y = -2, wheel untouched.
        dev.parse_report(&[0, 3, 0xFE, 0], 0);
        let events = sink.take();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, HidEventKind::MouseMotion { dx: 3, dy: -2 });
    }

    #[test]
    fn unchanged_mouse_report_is_silent() {
        let (mut dev, sink) = device(WHEEL_MOUSE);
        dev.parse_report(&[0, 3, 0xFE, 0], 0);
        sink.take();
        dev.parse_report(&[0, 3, 0xFE, 0], 0);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn mouse_buttons_and_wheel() {
        let (mut dev, sink) = device(WHEEL_MOUSE);
        dev.parse_report(&[0b0000_0101, 0, 0, 1], 0);
        let events = sink.take();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, HidEventKind::MouseButtonDown);
        assert_eq!(events[0].ordinal, 0);
        assert_eq!(events[1].kind, HidEventKind::MouseButtonDown);
        assert_eq!(events[1].ordinal, 2);
        assert_eq!(events[2].kind, HidEventKind::MouseWheel { delta: 1 });
        dev.parse_report(&[0b0000_0100, 0, 0, 1], 0);
        let events = sink.take();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, HidEventKind::MouseButtonUp);
        assert_eq!(events[0].ordinal, 0);
    }

    #[test]
    fn joystick_axes_emit_independently() {
        let (mut dev, sink) = device(GAMEPAD);
        // X to max, Y stays at its previous 0... which differs from center,
        // so the first report emits both axes; check values.
        dev.parse_report(&[255, 128, 0, 0], 0);
        let events = sink.take();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, HidEventKind::JoyAxis { pos: 32512 });
        assert_eq!(events[0].ordinal, 0);
        assert_eq!(events[1].kind, HidEventKind::JoyAxis { pos: 0 });
        assert_eq!(events[1].ordinal, 1);
        // Endpoint on the low side.
        dev.parse_report(&[0, 128, 0, 0], 0);
        let events = sink.take();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, HidEventKind::JoyAxis { pos: -32768 });
    }

    #[test]
    fn joystick_buttons_and_hat() {
        let (mut dev, sink) = device(GAMEPAD);
        dev.parse_report(&[0, 0, 0b0000_1010, 0x03], 0);
        let events = sink.take();
        // Buttons 1 and 3 down, hat position 3.
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, HidEventKind::JoyButtonDown);
        assert_eq!(events[0].ordinal, 1);
        assert_eq!(events[1].kind, HidEventKind::JoyButtonDown);
        assert_eq!(events[1].ordinal, 3);
        assert_eq!(events[2].kind, HidEventKind::JoyHat { pos: 3 });
    }

    #[test]
    fn short_report_reads_missing_bytes_as_zero() {
        let (mut dev, sink) = device(BOOT_KEYBOARD);
        dev.parse_report(&[0, 0, 4, 0, 0, 0, 0, 0], 0);
        sink.take();
        // Truncated follow-up: the key column reads as released.
        dev.parse_report(&[0], 0);
        assert_eq!(
            kinds(&sink.take()),
            vec![HidEventKind::KeyUp { keycode: 4 }]
        );
    }

    #[test]
    fn reports_with_other_ids_are_ignored() {
        let (mut dev, sink) = device(BOOT_KEYBOARD);
        dev.parse_report(&[0, 0, 4, 0, 0, 0, 0, 0], 1);
        assert!(sink.take().is_empty());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Normalized axis positions stay inside the signed 16-bit range
            /// and hit (approximately) both endpoints.
            #[test]
            fn axis_normalization_in_range(
                min in -32768i32..32767,
                span in 1i32..65535,
                offset in 0i32..65535,
            ) {
                let max = min.saturating_add(span).min(32767).max(min);
                let value = min + offset % (max - min + 1);
                let pos = normalize_axis(value, min, max);
                prop_assert!((-32768..=32767).contains(&pos));
                prop_assert_eq!(normalize_axis(min, min, max), -32768);
                prop_assert!(normalize_axis(max, min, max) > 32767 - 65536 / (max as i64 - min as i64 + 1) as i32 - 1);
            }

            /// Bit extraction agrees with a naive per-bit reference.
            #[test]
            fn field_bits_matches_reference(
                bytes in proptest::collection::vec(any::<u8>(), 1..8),
                bit_pos in 0u32..32,
                bit_len in 1u32..17,
            ) {
                let field = Field {
                    kind: FieldKind::JoyHat,
                    usage: 0,
                    ordinal: 0,
                    report_id: 0,
                    bit_pos,
                    bit_len,
                    array_count: 1,
                    logical_min: 0,
                    logical_max: i32::MAX,
                    prev: Prev::Scalar(0),
                };
                let got = field_bits(&bytes, &field, 0) as u32;
                let mut want = 0u32;
                for b in 0..bit_len {
                    let idx = (bit_pos + b) as usize;
                    let bit = bytes
                        .get(idx / 8)
                        .map(|byte| (byte >> (idx % 8)) & 1)
                        .unwrap_or(0);
                    want |= (bit as u32) << b;
                }
                prop_assert_eq!(got, want);
            }
        }
    }
}
