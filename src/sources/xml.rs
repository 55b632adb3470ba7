//! Small helpers over quick-xml's event reader.

use quick_xml::events::BytesStart;
use quick_xml::events::attributes::Attribute;
use std::collections::BTreeMap;

pub fn local_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).to_string()
}

pub fn attr_value(attr: &Attribute) -> String {
    String::from_utf8_lossy(&attr.value).to_string()
}

/// Attributes keyed by local name; namespace prefixes are dropped.
pub fn attributes(e: &BytesStart) -> BTreeMap<String, String> {
    e.attributes()
        .flatten()
        .map(|attr| {
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_string();
            (key, attr_value(&attr))
        })
        .collect()
}
