//! Subset DMR (XML) parser.
//!
//! Parses the DMR elements the decoding engine can exercise: `Dataset`,
//! `Dimension`, atomic variable elements (`Int32`, `Float64`, `String`,
//! ...), `Structure`, `Sequence`, `Enumeration`/`Enum`, `Dim` references,
//! and `Attribute` values. Unknown elements (e.g. `Map`) are skipped;
//! unknown variable types are rejected.

use std::sync::Arc;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{DmrError, DmrResult};
use crate::types::{
    AtomicType, Attribute, DapType, Dataset, Dimension, EnumType, StructType, Variable,
};

/// Parse a DMR document into a [`Dataset`].
pub fn parse_dmr(text: &str) -> DmrResult<Dataset> {
    let mut reader = Reader::from_str(text);
    reader.trim_text(true);
    loop {
        match reader.read_event()? {
            Event::Start(e) if local_name(&e) == "Dataset" => {
                let elem = Elem::capture(&e)?;
                let mut dataset = Dataset {
                    name: elem.attr("name").unwrap_or_default().to_string(),
                    ..Default::default()
                };
                parse_dataset_members(&mut reader, &mut dataset)?;
                tracing::debug!(
                    dataset = %dataset.name,
                    variables = dataset.variables.len(),
                    "parsed DMR"
                );
                return Ok(dataset);
            }
            Event::Eof => {
                return Err(DmrError::Invalid("missing <Dataset> root element".into()))
            }
            _ => {}
        }
    }
}

/// Owned copy of an element's tag and XML attributes, so the parser can
/// recurse while the underlying event buffer is reused.
struct Elem {
    tag: String,
    attrs: Vec<(String, String)>,
}

impl Elem {
    fn capture(e: &BytesStart<'_>) -> DmrResult<Self> {
        let tag = local_name(e);
        let mut attrs = Vec::new();
        for a in e.attributes() {
            let a = a.map_err(quick_xml::Error::from)?;
            let key = String::from_utf8_lossy(a.key.as_ref()).into_owned();
            let val = a.unescape_value()?.into_owned();
            attrs.push((key, val));
        }
        Ok(Self { tag, attrs })
    }

    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn require(&self, key: &str) -> DmrResult<&str> {
        self.attr(key).ok_or_else(|| DmrError::MissingAttribute {
            element: self.tag.clone(),
            attribute: key.to_string(),
        })
    }
}

/// Element name with any namespace prefix stripped.
fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn parse_dataset_members(reader: &mut Reader<&[u8]>, dataset: &mut Dataset) -> DmrResult<()> {
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let elem = Elem::capture(&e)?;
                match elem.tag.as_str() {
                    // Dimension/Enumeration are usually empty elements but
                    // may legally carry ignorable children.
                    "Dimension" => {
                        push_dimension_decl(dataset, &elem)?;
                        skip_element(reader, &e)?;
                    }
                    "Enumeration" => {
                        push_enum_decl(dataset, &elem)?;
                        skip_element(reader, &e)?;
                    }
                    "Attribute" => {
                        let attr = parse_attribute(reader, elem)?;
                        dataset.attributes.push(attr);
                    }
                    _ => {
                        let var = parse_variable(reader, elem, true, dataset)?;
                        dataset.variables.push(Arc::new(var));
                    }
                }
            }
            Event::Empty(e) => {
                let elem = Elem::capture(&e)?;
                match elem.tag.as_str() {
                    "Dimension" => push_dimension_decl(dataset, &elem)?,
                    "Enumeration" => push_enum_decl(dataset, &elem)?,
                    "Attribute" => dataset.attributes.push(attribute_from_inline(&elem)?),
                    _ => {
                        let var = parse_variable(reader, elem, false, dataset)?;
                        dataset.variables.push(Arc::new(var));
                    }
                }
            }
            Event::End(e) if e.local_name().as_ref() == b"Dataset" => return Ok(()),
            Event::Eof => return Err(DmrError::Invalid("unterminated <Dataset>".into())),
            _ => {}
        }
    }
}

fn push_dimension_decl(dataset: &mut Dataset, elem: &Elem) -> DmrResult<()> {
    let name = elem.require("name")?;
    let size = parse_size(elem.require("size")?, "Dimension")?;
    dataset.dimensions.push(Dimension::named(name, size));
    Ok(())
}

fn push_enum_decl(dataset: &mut Dataset, elem: &Elem) -> DmrResult<()> {
    let name = elem.require("name")?.to_string();
    let basetype = elem.require("basetype")?;
    let base = AtomicType::from_dmr_name(basetype)
        .filter(|t| t.is_fixed_size())
        .ok_or_else(|| DmrError::UnknownType(basetype.to_string()))?;
    dataset.enums.push(Arc::new(EnumType { name, base }));
    Ok(())
}

/// Parse one variable declaration (atomic, Enum, Structure, or Sequence).
///
/// `has_children` is true when the element was opened with a start tag and
/// the reader is positioned inside its body.
fn parse_variable(
    reader: &mut Reader<&[u8]>,
    elem: Elem,
    has_children: bool,
    dataset: &Dataset,
) -> DmrResult<Variable> {
    let name = elem.require("name")?.to_string();
    let is_container = elem.tag == "Structure" || elem.tag == "Sequence";

    let mut dims = Vec::new();
    let mut attributes = Vec::new();
    let mut fields: Vec<Arc<Variable>> = Vec::new();

    if has_children {
        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    let child = Elem::capture(&e)?;
                    match child.tag.as_str() {
                        "Dim" => {
                            dims.push(resolve_dim(&child, dataset)?);
                            skip_element(reader, &e)?;
                        }
                        "Attribute" => attributes.push(parse_attribute(reader, child)?),
                        _ if is_container => {
                            let field = parse_variable(reader, child, true, dataset)?;
                            fields.push(Arc::new(field));
                        }
                        // e.g. <Map>, ignorable on atomic variables
                        _ => skip_element(reader, &e)?,
                    }
                }
                Event::Empty(e) => {
                    let child = Elem::capture(&e)?;
                    match child.tag.as_str() {
                        "Dim" => dims.push(resolve_dim(&child, dataset)?),
                        "Attribute" => attributes.push(attribute_from_inline(&child)?),
                        _ if is_container => {
                            let field = parse_variable(reader, child, false, dataset)?;
                            fields.push(Arc::new(field));
                        }
                        _ => {}
                    }
                }
                Event::End(e) if local_name_of_end(&e) == elem.tag => break,
                Event::Eof => {
                    return Err(DmrError::Invalid(format!("unterminated <{}>", elem.tag)))
                }
                _ => {}
            }
        }
    }

    let ty = match elem.tag.as_str() {
        "Structure" => DapType::Structure(Arc::new(StructType {
            name: name.clone(),
            fields,
        })),
        "Sequence" => DapType::Sequence(Arc::new(StructType {
            name: name.clone(),
            fields,
        })),
        "Enum" => {
            let target = elem.require("enum")?;
            let et = dataset
                .find_enum(target)
                .ok_or_else(|| DmrError::UndefinedEnumeration(target.to_string()))?;
            DapType::Enum(Arc::clone(et))
        }
        tag => DapType::Atomic(
            AtomicType::from_dmr_name(tag).ok_or_else(|| DmrError::UnknownType(tag.to_string()))?,
        ),
    };

    Ok(Variable {
        name,
        ty,
        dims,
        attributes,
    })
}

/// Resolve a `<Dim>` element: either a `name` reference to a dataset-level
/// declaration or an inline anonymous `size`.
fn resolve_dim(elem: &Elem, dataset: &Dataset) -> DmrResult<Dimension> {
    if let Some(name) = elem.attr("name") {
        let decl = dataset
            .find_dimension(name)
            .ok_or_else(|| DmrError::UndefinedDimension(name.to_string()))?;
        return Ok(decl.clone());
    }
    if let Some(size) = elem.attr("size") {
        return Ok(Dimension::anonymous(parse_size(size, "Dim")?));
    }
    Err(DmrError::Invalid(
        "<Dim> requires a name reference or an inline size".into(),
    ))
}

fn parse_size(text: &str, element: &str) -> DmrResult<u64> {
    text.trim()
        .parse::<u64>()
        .map_err(|_| DmrError::Invalid(format!("<{element}> size is not an integer: {text:?}")))
}

/// Parse an `<Attribute>` element with `<Value>` children.
fn parse_attribute(reader: &mut Reader<&[u8]>, elem: Elem) -> DmrResult<Attribute> {
    let name = elem.require("name")?.to_string();
    let mut values: Vec<String> = elem
        .attr("value")
        .map(|v| vec![v.to_string()])
        .unwrap_or_default();
    loop {
        match reader.read_event()? {
            Event::Start(e) if local_name(&e) == "Value" => {
                let text = reader.read_text(e.name())?;
                values.push(text.into_owned());
            }
            Event::Empty(e) if e.local_name().as_ref() == b"Value" => {
                let child = Elem::capture(&e)?;
                values.push(child.attr("value").unwrap_or_default().to_string());
            }
            Event::Start(e) => skip_element(reader, &e)?,
            Event::End(e) if e.local_name().as_ref() == b"Attribute" => break,
            Event::Eof => return Err(DmrError::Invalid("unterminated <Attribute>".into())),
            _ => {}
        }
    }
    Ok(Attribute { name, values })
}

fn attribute_from_inline(elem: &Elem) -> DmrResult<Attribute> {
    let name = elem.require("name")?.to_string();
    let values = elem
        .attr("value")
        .map(|v| vec![v.to_string()])
        .unwrap_or_default();
    Ok(Attribute { name, values })
}

fn skip_element(reader: &mut Reader<&[u8]>, e: &BytesStart<'_>) -> DmrResult<()> {
    reader.read_to_end(e.name())?;
    Ok(())
}

fn local_name_of_end(e: &quick_xml::events::BytesEnd<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}
