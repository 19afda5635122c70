use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use dicom::core::smallvec::SmallVec;
use dicom::core::value::{PixelFragmentSequence, Value as DicomValue};
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::object::{FileDicomObject, FileMetaTableBuilder, InMemDicomObject};
use dicom_dictionary_std::tags;
use serde_json::Value;
use tracing::debug;

use crate::error::MedStoreError;

type InMemElement = DataElement<InMemDicomObject, Vec<u8>>;

/// Build a complete DICOM object from one instance's DICOM-JSON tag map and
/// its fetched frame payloads.
///
/// Group-0002 attributes feed the file meta table (falling back to the
/// dataset's SOP class/instance UIDs); the pixel data becomes an
/// encapsulated fragment sequence with one fragment per frame. Sequences
/// and unsupported VRs are skipped. The pipelines treat this as an opaque
/// codec: DICOM-JSON in, writable Part-10 object out.
pub fn assemble_instance(
    meta: &Value,
    transfer_syntax: &str,
    frames: Vec<Bytes>,
) -> Result<FileDicomObject<InMemDicomObject>, MedStoreError> {
    let attrs = meta
        .as_object()
        .ok_or_else(|| MedStoreError::Assemble("instance metadata is not a JSON object".into()))?;

    let mut obj = InMemDicomObject::new_empty();
    let mut media_sop_class: Option<String> = None;
    let mut media_sop_instance: Option<String> = None;

    for (key, attr) in attrs {
        let Some(tag) = parse_tag(key) else {
            debug!("skipping unparsable tag key {key}");
            continue;
        };
        if tag.group() == 0x0002 {
            // file meta group: only the storage UIDs matter, the builder
            // regenerates the rest
            match tag.element() {
                0x0002 => media_sop_class = first_string(attr),
                0x0003 => media_sop_instance = first_string(attr),
                _ => {}
            }
            continue;
        }
        match element_from_json(tag, attr) {
            Some(element) => {
                obj.put(element);
            }
            None => debug!("skipping unsupported attribute {tag}"),
        }
    }

    let sop_class = media_sop_class
        .or_else(|| element_string(&obj, tags::SOP_CLASS_UID))
        .ok_or_else(|| MedStoreError::Assemble("instance has no SOP class UID".into()))?;
    let sop_instance = media_sop_instance
        .or_else(|| element_string(&obj, tags::SOP_INSTANCE_UID))
        .ok_or_else(|| MedStoreError::Assemble("instance has no SOP instance UID".into()))?;

    let fragments: SmallVec<[Vec<u8>; 2]> = frames
        .into_iter()
        .map(|frame| {
            let mut fragment = frame.to_vec();
            if fragment.len() % 2 == 1 {
                fragment.push(0);
            }
            fragment
        })
        .collect();
    obj.put(InMemElement::new(
        tags::PIXEL_DATA,
        VR::OB,
        DicomValue::PixelSequence(PixelFragmentSequence::new(
            SmallVec::<[u32; 2]>::new(),
            fragments,
        )),
    ));

    obj.with_meta(
        FileMetaTableBuilder::new()
            .transfer_syntax(transfer_syntax)
            .media_storage_sop_class_uid(sop_class)
            .media_storage_sop_instance_uid(sop_instance),
    )
    .map_err(|err| MedStoreError::Assemble(err.to_string()))
}

/// Transfer syntax UID of an instance, read from its first frame's tags.
pub fn frame_transfer_syntax(frame_meta: &Value) -> Option<String> {
    first_string(frame_meta.get("00020010")?)
}

fn parse_tag(key: &str) -> Option<Tag> {
    if key.len() != 8 || !key.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let group = u16::from_str_radix(&key[..4], 16).ok()?;
    let element = u16::from_str_radix(&key[4..], 16).ok()?;
    Some(Tag(group, element))
}

fn first_string(attr: &Value) -> Option<String> {
    attr.get("Value")?
        .as_array()?
        .first()
        .and_then(Value::as_str)
        .map(String::from)
}

fn element_string(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|element| element.to_str().ok())
        .map(|value| value.trim_end_matches('\0').trim().to_string())
        .filter(|value| !value.is_empty())
}

fn element_from_json(tag: Tag, attr: &Value) -> Option<InMemElement> {
    let vr = parse_vr(attr.get("vr").and_then(Value::as_str).unwrap_or("UN"))?;

    if let Some(encoded) = attr.get("InlineBinary").and_then(Value::as_str) {
        let bytes = BASE64.decode(encoded).ok()?;
        return Some(InMemElement::new(tag, vr, PrimitiveValue::U8(bytes.into())));
    }

    let Some(values) = attr.get("Value").and_then(Value::as_array) else {
        return Some(InMemElement::new(tag, vr, PrimitiveValue::Empty));
    };

    let value = match vr {
        VR::PN => PrimitiveValue::Strs(
            values
                .iter()
                .filter_map(person_name)
                .collect::<Vec<_>>()
                .into(),
        ),
        VR::AE
        | VR::AS
        | VR::CS
        | VR::DA
        | VR::DT
        | VR::LO
        | VR::LT
        | VR::SH
        | VR::ST
        | VR::TM
        | VR::UC
        | VR::UI
        | VR::UR
        | VR::UT => PrimitiveValue::Strs(
            values
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect::<Vec<_>>()
                .into(),
        ),
        // decimal/integer strings arrive as JSON numbers but stay strings
        // on the wire
        VR::DS | VR::IS => PrimitiveValue::Strs(
            values
                .iter()
                .map(|value| match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .into(),
        ),
        VR::US => PrimitiveValue::U16(
            values
                .iter()
                .filter_map(Value::as_u64)
                .map(|v| v as u16)
                .collect::<Vec<_>>()
                .into(),
        ),
        VR::UL => PrimitiveValue::U32(
            values
                .iter()
                .filter_map(Value::as_u64)
                .map(|v| v as u32)
                .collect::<Vec<_>>()
                .into(),
        ),
        VR::SS => PrimitiveValue::I16(
            values
                .iter()
                .filter_map(Value::as_i64)
                .map(|v| v as i16)
                .collect::<Vec<_>>()
                .into(),
        ),
        VR::SL => PrimitiveValue::I32(
            values
                .iter()
                .filter_map(Value::as_i64)
                .map(|v| v as i32)
                .collect::<Vec<_>>()
                .into(),
        ),
        VR::FL => PrimitiveValue::F32(
            values
                .iter()
                .filter_map(Value::as_f64)
                .map(|v| v as f32)
                .collect::<Vec<_>>()
                .into(),
        ),
        VR::FD => PrimitiveValue::F64(
            values
                .iter()
                .filter_map(Value::as_f64)
                .collect::<Vec<_>>()
                .into(),
        ),
        _ => return None,
    };
    Some(InMemElement::new(tag, vr, value))
}

fn person_name(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Object(parts) => parts
            .get("Alphabetic")
            .and_then(Value::as_str)
            .map(String::from),
        _ => None,
    }
}

fn parse_vr(name: &str) -> Option<VR> {
    let vr = match name {
        "AE" => VR::AE,
        "AS" => VR::AS,
        "CS" => VR::CS,
        "DA" => VR::DA,
        "DS" => VR::DS,
        "DT" => VR::DT,
        "FL" => VR::FL,
        "FD" => VR::FD,
        "IS" => VR::IS,
        "LO" => VR::LO,
        "LT" => VR::LT,
        "OB" => VR::OB,
        "OW" => VR::OW,
        "PN" => VR::PN,
        "SH" => VR::SH,
        "SL" => VR::SL,
        "SS" => VR::SS,
        "ST" => VR::ST,
        "TM" => VR::TM,
        "UC" => VR::UC,
        "UI" => VR::UI,
        "UL" => VR::UL,
        "UN" => VR::UN,
        "UR" => VR::UR,
        "US" => VR::US,
        "UT" => VR::UT,
        _ => return None,
    };
    Some(vr)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const JPEG2000_LOSSLESS: &str = "1.2.840.10008.1.2.4.90";

    fn instance_meta() -> Value {
        json!({
            "00080016": { "vr": "UI", "Value": ["1.2.840.10008.5.1.4.1.1.2"] },
            "00080018": { "vr": "UI", "Value": ["1.2.826.0.1.3680043.2.1125.1"] },
            "00100010": { "vr": "PN", "Value": [{ "Alphabetic": "Doe^John" }] },
            "00280010": { "vr": "US", "Value": [2] },
            "00280011": { "vr": "US", "Value": [2] },
            "00281050": { "vr": "DS", "Value": [40] },
            "00080060": { "vr": "CS", "Value": ["CT"] }
        })
    }

    #[test]
    fn assembles_instance_from_json() {
        let frames = vec![Bytes::from_static(&[1, 2, 3, 4])];
        let obj = assemble_instance(&instance_meta(), JPEG2000_LOSSLESS, frames).unwrap();

        let name = obj.element(tags::PATIENT_NAME).unwrap().to_str().unwrap();
        assert_eq!(name.trim_end_matches('\0').trim(), "Doe^John");
        let modality = obj.element(tags::MODALITY).unwrap().to_str().unwrap();
        assert_eq!(modality.trim_end_matches('\0').trim(), "CT");
        assert_eq!(
            obj.meta().transfer_syntax.trim_end_matches('\0'),
            JPEG2000_LOSSLESS
        );
    }

    #[test]
    fn written_file_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.dcm");
        let frames = vec![Bytes::from_static(&[0, 1, 2, 3]), Bytes::from_static(&[4, 5])];
        let obj = assemble_instance(&instance_meta(), JPEG2000_LOSSLESS, frames).unwrap();
        obj.write_to_file(&path).unwrap();

        let reopened = dicom::object::open_file(&path).unwrap();
        let name = reopened
            .element(tags::PATIENT_NAME)
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(name.trim_end_matches('\0').trim(), "Doe^John");
    }

    #[test]
    fn skips_sequences_and_unknown_tags() {
        let mut meta = instance_meta();
        meta["00081115"] = json!({ "vr": "SQ", "Value": [{}] });
        meta["garbage"] = json!({ "vr": "LO", "Value": ["x"] });
        let obj = assemble_instance(&meta, JPEG2000_LOSSLESS, vec![Bytes::from_static(&[0, 0])])
            .unwrap();
        assert!(obj.element(Tag(0x0008, 0x1115)).is_err());
    }

    #[test]
    fn missing_sop_uids_fail() {
        let meta = json!({ "00100010": { "vr": "PN", "Value": ["X"] } });
        let result = assemble_instance(&meta, JPEG2000_LOSSLESS, vec![]);
        assert!(result.is_err());
    }

    #[test]
    fn reads_frame_transfer_syntax() {
        let frame = json!({ "00020010": { "vr": "UI", "Value": [JPEG2000_LOSSLESS] } });
        assert_eq!(
            frame_transfer_syntax(&frame).as_deref(),
            Some(JPEG2000_LOSSLESS)
        );
        assert_eq!(frame_transfer_syntax(&json!({})), None);
    }
}
