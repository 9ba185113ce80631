//! Field classification and table construction.
//!
//! A walked descriptor becomes a flat table of classified fields. The device
//! type is inferred from Generic Desktop usages as they appear (a mouse
//! collection makes the following fields mouse fields, and so on); once set
//! it persists until another top-level usage overrides it. Fields that
//! classify as nothing, and CONST padding, never enter the table.

use crate::items::{ItemFlags, ReportItem};
use crate::usages::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Key-code array (the classic 6-key roll-over block).
    Key,
    /// Single-bit keyboard modifier.
    KeyMod,
    JoyButton,
    JoyAxis,
    JoyHat,
    MouseButton,
    MouseAxisX,
    MouseAxisY,
    MouseWheel,
}

pub(crate) const KIND_COUNT: usize = 9;

impl FieldKind {
    pub(crate) fn index(self) -> usize {
        match self {
            FieldKind::Key => 0,
            FieldKind::KeyMod => 1,
            FieldKind::JoyButton => 2,
            FieldKind::JoyAxis => 3,
            FieldKind::JoyHat => 4,
            FieldKind::MouseButton => 5,
            FieldKind::MouseAxisX => 6,
            FieldKind::MouseAxisY => 7,
            FieldKind::MouseWheel => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceType {
    None,
    Mouse,
    Keyboard,
    Joystick,
}

fn device_type_for(page: u16, id: u16) -> DeviceType {
    if page != PAGE_GENERIC_DESKTOP {
        return DeviceType::None;
    }
    match id {
        GD_POINTER | GD_MOUSE => DeviceType::Mouse,
        GD_KEYBOARD | GD_KEYPAD => DeviceType::Keyboard,
        GD_JOYSTICK | GD_GAMEPAD => DeviceType::Joystick,
        _ => DeviceType::None,
    }
}

fn classify(devtype: DeviceType, page: u16, id: u16, bit_len: u32) -> Option<FieldKind> {
    match devtype {
        DeviceType::Mouse => match (page, id) {
            (PAGE_GENERIC_DESKTOP, GD_X) => Some(FieldKind::MouseAxisX),
            (PAGE_GENERIC_DESKTOP, GD_Y) => Some(FieldKind::MouseAxisY),
            (PAGE_GENERIC_DESKTOP, GD_WHEEL) => Some(FieldKind::MouseWheel),
            (PAGE_BUTTON, _) => Some(FieldKind::MouseButton),
            _ => None,
        },
        DeviceType::Keyboard => {
            if page == PAGE_KEYBOARD {
                // 1-bit keyboard fields are taken to be modifiers.
                if bit_len == 1 {
                    Some(FieldKind::KeyMod)
                } else {
                    Some(FieldKind::Key)
                }
            } else {
                None
            }
        }
        DeviceType::Joystick => match (page, id) {
            (PAGE_BUTTON, _) => Some(FieldKind::JoyButton),
            (PAGE_GENERIC_DESKTOP, GD_HAT_SWITCH) => Some(FieldKind::JoyHat),
            (PAGE_GENERIC_DESKTOP, id) if (GD_X..=GD_RZ).contains(&id) => {
                Some(FieldKind::JoyAxis)
            }
            _ => None,
        },
        DeviceType::None => None,
    }
}

/// Last value(s) seen for a field, keyed by its element count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Prev {
    Scalar(u32),
    Vector(Box<[u32]>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Field {
    pub(crate) kind: FieldKind,
    /// Combined `page << 16 | id` usage of the field.
    pub(crate) usage: u32,
    /// Stable 0-based index among fields of the same kind.
    pub(crate) ordinal: u32,
    pub(crate) report_id: u8,
    pub(crate) bit_pos: u32,
    pub(crate) bit_len: u32,
    pub(crate) array_count: u32,
    pub(crate) logical_min: i32,
    pub(crate) logical_max: i32,
    pub(crate) prev: Prev,
}

/// Two passes over the walked items: the first counts classified fields so
/// the table allocation is exact, the second fills it in and hands out
/// per-kind ordinals.
pub(crate) fn build_field_table(items: &[ReportItem]) -> Vec<Field> {
    let count = classified(items).count();
    let mut fields = Vec::with_capacity(count);
    let mut ordinals = [0u32; KIND_COUNT];
    for (kind, f) in classified(items) {
        let ordinal = ordinals[kind.index()];
        ordinals[kind.index()] += 1;
        let prev = if f.array_count > 1 {
            Prev::Vector(vec![0u32; f.array_count as usize].into_boxed_slice())
        } else {
            Prev::Scalar(0)
        };
        fields.push(Field {
            kind,
            usage: f.usage,
            ordinal,
            report_id: f.report_id,
            bit_pos: f.bit_pos,
            bit_len: f.bit_len,
            array_count: f.array_count,
            logical_min: f.logical_min,
            logical_max: f.logical_max,
            prev,
        });
    }
    fields
}

fn classified(
    items: &[ReportItem],
) -> impl Iterator<Item = (FieldKind, &crate::items::InputField)> {
    let mut devtype = DeviceType::None;
    items.iter().filter_map(move |item| {
        let (usage, field) = match item {
            ReportItem::Collection { usage } => (*usage, None),
            ReportItem::Input(f) => (f.usage, Some(f)),
            ReportItem::EndCollection => return None,
        };
        let dt = device_type_for(usage_page(usage), usage_id(usage));
        if dt != DeviceType::None {
            devtype = dt;
        }
        let f = field?;
        if f.flags.contains(ItemFlags::CONST) {
            return None;
        }
        classify(devtype, usage_page(f.usage), usage_id(f.usage), f.bit_len).map(|kind| (kind, f))
    })
}
