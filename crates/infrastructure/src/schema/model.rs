//! XSD 文档编译为内部模型
//!
//! 只支持网关 Schema 用到的子集，遇到其余构造直接报错，
//! 避免静默放过本应被拒绝的消息。

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};

use regex::Regex;
use roxmltree::Node;

pub(crate) const XSD_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema";
pub(crate) const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Builtin {
    String,
    NormalizedString,
    Token,
    AnyUri,
    Boolean,
    Int,
    Integer,
    Long,
    Short,
    Byte,
    NonNegativeInteger,
    PositiveInteger,
    UnsignedLong,
    UnsignedInt,
    UnsignedShort,
    UnsignedByte,
}

impl Builtin {
    fn from_local_name(name: &str) -> Option<Self> {
        let builtin = match name {
            "string" => Builtin::String,
            "normalizedString" => Builtin::NormalizedString,
            "token" => Builtin::Token,
            "anyURI" => Builtin::AnyUri,
            "boolean" => Builtin::Boolean,
            "int" => Builtin::Int,
            "integer" => Builtin::Integer,
            "long" => Builtin::Long,
            "short" => Builtin::Short,
            "byte" => Builtin::Byte,
            "nonNegativeInteger" => Builtin::NonNegativeInteger,
            "positiveInteger" => Builtin::PositiveInteger,
            "unsignedLong" => Builtin::UnsignedLong,
            "unsignedInt" => Builtin::UnsignedInt,
            "unsignedShort" => Builtin::UnsignedShort,
            "unsignedByte" => Builtin::UnsignedByte,
            _ => return None,
        };
        Some(builtin)
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Builtin::String => "xs:string",
            Builtin::NormalizedString => "xs:normalizedString",
            Builtin::Token => "xs:token",
            Builtin::AnyUri => "xs:anyURI",
            Builtin::Boolean => "xs:boolean",
            Builtin::Int => "xs:int",
            Builtin::Integer => "xs:integer",
            Builtin::Long => "xs:long",
            Builtin::Short => "xs:short",
            Builtin::Byte => "xs:byte",
            Builtin::NonNegativeInteger => "xs:nonNegativeInteger",
            Builtin::PositiveInteger => "xs:positiveInteger",
            Builtin::UnsignedLong => "xs:unsignedLong",
            Builtin::UnsignedInt => "xs:unsignedInt",
            Builtin::UnsignedShort => "xs:unsignedShort",
            Builtin::UnsignedByte => "xs:unsignedByte",
        }
    }

    fn integer_range(&self) -> Option<(i128, i128)> {
        let range = match self {
            Builtin::Int => (i32::MIN as i128, i32::MAX as i128),
            Builtin::Integer => (i128::MIN, i128::MAX),
            Builtin::Long => (i64::MIN as i128, i64::MAX as i128),
            Builtin::Short => (i16::MIN as i128, i16::MAX as i128),
            Builtin::Byte => (i8::MIN as i128, i8::MAX as i128),
            Builtin::NonNegativeInteger => (0, i128::MAX),
            Builtin::PositiveInteger => (1, i128::MAX),
            Builtin::UnsignedLong => (0, u64::MAX as i128),
            Builtin::UnsignedInt => (0, u32::MAX as i128),
            Builtin::UnsignedShort => (0, u16::MAX as i128),
            Builtin::UnsignedByte => (0, u8::MAX as i128),
            _ => return None,
        };
        Some(range)
    }

    /// 按内置类型的 whiteSpace 规则规范化取值
    pub(crate) fn normalize<'a>(&self, value: &'a str) -> Cow<'a, str> {
        match self {
            Builtin::String => Cow::Borrowed(value),
            Builtin::NormalizedString => {
                if value.contains(['\t', '\n', '\r']) {
                    Cow::Owned(value.replace(['\t', '\n', '\r'], " "))
                } else {
                    Cow::Borrowed(value)
                }
            }
            _ => {
                let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
                if collapsed == value {
                    Cow::Borrowed(value)
                } else {
                    Cow::Owned(collapsed)
                }
            }
        }
    }

    /// 检查已规范化的取值是否符合词法空间
    pub(crate) fn accepts(&self, value: &str) -> bool {
        match self {
            Builtin::String | Builtin::NormalizedString | Builtin::Token | Builtin::AnyUri => true,
            Builtin::Boolean => matches!(value, "true" | "false" | "1" | "0"),
            _ => match (parse_integer(value), self.integer_range()) {
                (Some(number), Some((min, max))) => number >= min && number <= max,
                _ => false,
            },
        }
    }
}

pub(crate) fn parse_integer(value: &str) -> Option<i128> {
    let digits = value.strip_prefix(['+', '-']).unwrap_or(value);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse::<i128>().ok()
}

#[derive(Debug, Clone)]
pub(crate) enum TypeRef {
    Builtin(Builtin),
    /// 引用具名类型，编译结束时校验存在
    Named(String),
    Simple(Box<SimpleType>),
    Complex(Box<ComplexType>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MaxOccurs {
    Bounded(u32),
    Unbounded,
}

impl MaxOccurs {
    pub(crate) fn allows(&self, count: u32) -> bool {
        match self {
            MaxOccurs::Bounded(max) => count <= *max,
            MaxOccurs::Unbounded => true,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ElementDecl {
    pub name: String,
    pub type_ref: TypeRef,
    pub min_occurs: u32,
    pub max_occurs: MaxOccurs,
}

#[derive(Debug, Clone)]
pub(crate) struct AttributeDecl {
    pub name: String,
    pub type_ref: TypeRef,
    pub required: bool,
}

#[derive(Debug, Clone)]
pub(crate) enum Content {
    Empty,
    Sequence(Vec<ElementDecl>),
    Simple(TypeRef),
}

#[derive(Debug, Clone)]
pub(crate) struct ComplexType {
    pub content: Content,
    pub attributes: Vec<AttributeDecl>,
}

#[derive(Debug, Clone)]
pub(crate) struct SimpleType {
    pub base: TypeRef,
    pub facets: Facets,
}

#[derive(Debug, Clone)]
pub(crate) struct Pattern {
    pub source: String,
    pub regex: Regex,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Facets {
    pub patterns: Vec<Pattern>,
    pub enumeration: Vec<String>,
    pub length: Option<usize>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub min_inclusive: Option<i128>,
    pub max_inclusive: Option<i128>,
}

impl Facets {
    pub(crate) fn check(&self, value: &str) -> Result<(), String> {
        let length = value.chars().count();
        if let Some(expected) = self.length {
            if length != expected {
                return Err(format!(
                    "[facet 'length'] The value has a length of '{length}'; this differs from the allowed length of '{expected}'."
                ));
            }
        }
        if let Some(min) = self.min_length {
            if length < min {
                return Err(format!(
                    "[facet 'minLength'] The value has a length of '{length}'; this underruns the allowed minimum length of '{min}'."
                ));
            }
        }
        if let Some(max) = self.max_length {
            if length > max {
                return Err(format!(
                    "[facet 'maxLength'] The value has a length of '{length}'; this exceeds the allowed maximum length of '{max}'."
                ));
            }
        }

        // 同一步派生内的多个 pattern 是"或"的关系
        if !self.patterns.is_empty() && !self.patterns.iter().any(|p| p.regex.is_match(value)) {
            return Err(format!(
                "[facet 'pattern'] The value '{value}' is not accepted by the pattern '{}'.",
                self.patterns[0].source
            ));
        }

        if !self.enumeration.is_empty() && !self.enumeration.iter().any(|e| e == value) {
            let set = self
                .enumeration
                .iter()
                .map(|e| format!("'{e}'"))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(format!(
                "[facet 'enumeration'] The value '{value}' is not an element of the set {{{set}}}."
            ));
        }

        if self.min_inclusive.is_some() || self.max_inclusive.is_some() {
            let number = parse_integer(value)
                .ok_or_else(|| format!("'{value}' is not a valid integer value."))?;
            if let Some(min) = self.min_inclusive {
                if number < min {
                    return Err(format!(
                        "[facet 'minInclusive'] The value '{value}' is less than the minimum value allowed ('{min}')."
                    ));
                }
            }
            if let Some(max) = self.max_inclusive {
                if number > max {
                    return Err(format!(
                        "[facet 'maxInclusive'] The value '{value}' is greater than the maximum value allowed ('{max}')."
                    ));
                }
            }
        }
        Ok(())
    }
}

/// 类型引用解析后的视图
pub(crate) enum Resolved<'a> {
    Builtin(Builtin),
    Simple(&'a SimpleType),
    Complex(&'a ComplexType),
}

#[derive(Debug, Clone, Default)]
pub(crate) struct XsdModel {
    pub target_namespace: Option<String>,
    elements: HashMap<String, ElementDecl>,
    simple_types: HashMap<String, SimpleType>,
    complex_types: HashMap<String, ComplexType>,
}

impl XsdModel {
    pub(crate) fn compile(text: &str) -> Result<Self, String> {
        let document = roxmltree::Document::parse(text)
            .map_err(|e| format!("schema document is not well-formed XML: {e}"))?;
        let root = document.root_element();
        if root.tag_name().namespace() != Some(XSD_NAMESPACE) || root.tag_name().name() != "schema" {
            return Err("the document element is not xs:schema".to_string());
        }

        let mut model = XsdModel {
            target_namespace: root.attribute("targetNamespace").map(str::to_string),
            ..XsdModel::default()
        };

        for child in element_children(root) {
            match xsd_name(child)? {
                "annotation" => {}
                "element" => {
                    let decl = parse_element(child, true)?;
                    if model.elements.contains_key(&decl.name) {
                        return Err(format!("global element '{}' is declared twice", decl.name));
                    }
                    model.elements.insert(decl.name.clone(), decl);
                }
                "complexType" => {
                    let name = required_attribute(child, "name")?.to_string();
                    let complex = parse_complex_type(child)?;
                    model.ensure_unique_type(&name)?;
                    model.complex_types.insert(name, complex);
                }
                "simpleType" => {
                    let name = required_attribute(child, "name")?.to_string();
                    let simple = parse_simple_type(child)?;
                    model.ensure_unique_type(&name)?;
                    model.simple_types.insert(name, simple);
                }
                other => return Err(unsupported(other)),
            }
        }

        model.check_references()?;
        Ok(model)
    }

    pub(crate) fn global_element(&self, name: &str) -> Option<&ElementDecl> {
        self.elements.get(name)
    }

    pub(crate) fn element_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.elements.keys().map(String::as_str)
    }

    pub(crate) fn resolve<'a>(&'a self, type_ref: &'a TypeRef) -> Result<Resolved<'a>, String> {
        match type_ref {
            TypeRef::Builtin(builtin) => Ok(Resolved::Builtin(*builtin)),
            TypeRef::Simple(simple) => Ok(Resolved::Simple(simple)),
            TypeRef::Complex(complex) => Ok(Resolved::Complex(complex)),
            TypeRef::Named(name) => {
                if let Some(simple) = self.simple_types.get(name) {
                    Ok(Resolved::Simple(simple))
                } else if let Some(complex) = self.complex_types.get(name) {
                    Ok(Resolved::Complex(complex))
                } else {
                    Err(format!("type '{name}' is not declared"))
                }
            }
        }
    }

    /// 简单类型派生链最终的内置类型
    pub(crate) fn primitive_of(&self, type_ref: &TypeRef) -> Result<Builtin, String> {
        let mut current = type_ref;
        loop {
            match self.resolve(current)? {
                Resolved::Builtin(builtin) => return Ok(builtin),
                Resolved::Simple(simple) => current = &simple.base,
                Resolved::Complex(_) => {
                    return Err("a complex type cannot be the base of a simple type".to_string())
                }
            }
        }
    }

    fn ensure_unique_type(&self, name: &str) -> Result<(), String> {
        if self.simple_types.contains_key(name) || self.complex_types.contains_key(name) {
            return Err(format!("type '{name}' is declared twice"));
        }
        Ok(())
    }

    fn check_references(&self) -> Result<(), String> {
        for (name, simple) in &self.simple_types {
            self.check_simple_chain(name, simple)?;
        }
        for complex in self.complex_types.values() {
            self.check_complex(complex)?;
        }
        for element in self.elements.values() {
            self.check_type_ref(&element.type_ref, false)?;
        }
        Ok(())
    }

    fn check_simple_chain(&self, name: &str, simple: &SimpleType) -> Result<(), String> {
        let mut seen = HashSet::from([name.to_string()]);
        let mut base = &simple.base;
        loop {
            match base {
                TypeRef::Builtin(_) => return Ok(()),
                TypeRef::Complex(_) => {
                    return Err(format!("simple type '{name}' cannot restrict a complex type"))
                }
                TypeRef::Simple(inline) => base = &inline.base,
                TypeRef::Named(next) => {
                    if !seen.insert(next.clone()) {
                        return Err(format!("simple type '{name}' has a circular derivation"));
                    }
                    match self.simple_types.get(next) {
                        Some(simple) => base = &simple.base,
                        None => {
                            return Err(format!(
                                "simple type '{name}' restricts '{next}' which is not a declared simple type"
                            ))
                        }
                    }
                }
            }
        }
    }

    fn check_complex(&self, complex: &ComplexType) -> Result<(), String> {
        for attribute in &complex.attributes {
            self.check_type_ref(&attribute.type_ref, true)?;
        }
        match &complex.content {
            Content::Empty => Ok(()),
            Content::Simple(type_ref) => self.check_type_ref(type_ref, true),
            Content::Sequence(particles) => particles
                .iter()
                .try_for_each(|particle| self.check_type_ref(&particle.type_ref, false)),
        }
    }

    fn check_type_ref(&self, type_ref: &TypeRef, simple_only: bool) -> Result<(), String> {
        match type_ref {
            TypeRef::Builtin(_) => Ok(()),
            TypeRef::Simple(simple) => self.check_type_ref(&simple.base, true),
            TypeRef::Complex(complex) if !simple_only => self.check_complex(complex),
            TypeRef::Complex(_) => Err("a complex type is used where a simple type is required".to_string()),
            TypeRef::Named(name) => {
                if self.simple_types.contains_key(name) {
                    Ok(())
                } else if self.complex_types.contains_key(name) {
                    if simple_only {
                        Err(format!("complex type '{name}' is used where a simple type is required"))
                    } else {
                        Ok(())
                    }
                } else {
                    Err(format!("type '{name}' is not declared"))
                }
            }
        }
    }
}

pub(crate) fn element_children<'a, 'input>(
    node: Node<'a, 'input>,
) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|child| child.is_element())
}

fn xsd_name<'a>(node: Node<'a, '_>) -> Result<&'a str, String> {
    if node.tag_name().namespace() != Some(XSD_NAMESPACE) {
        return Err(format!(
            "element '{}' is not in the XML Schema namespace",
            node.tag_name().name()
        ));
    }
    Ok(node.tag_name().name())
}

fn unsupported(construct: &str) -> String {
    format!("schema construct '{construct}' is not supported")
}

fn required_attribute<'a>(node: Node<'a, '_>, name: &str) -> Result<&'a str, String> {
    node.attribute(name).ok_or_else(|| {
        format!(
            "xs:{} is missing the required attribute '{name}'",
            node.tag_name().name()
        )
    })
}

fn resolve_qname<'a>(node: Node<'a, '_>, qname: &'a str) -> Result<TypeRef, String> {
    let (prefix, local) = match qname.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, qname),
    };
    match node.lookup_namespace_uri(prefix) {
        Some(XSD_NAMESPACE) => Builtin::from_local_name(local)
            .map(TypeRef::Builtin)
            .ok_or_else(|| format!("built-in type 'xs:{local}' is not supported")),
        None if prefix.is_some() => Err(format!("namespace prefix of '{qname}' is not declared")),
        _ => Ok(TypeRef::Named(local.to_string())),
    }
}

fn parse_occurs(value: Option<&str>, attribute: &str) -> Result<u32, String> {
    match value {
        None => Ok(1),
        Some(raw) => raw
            .trim()
            .parse::<u32>()
            .map_err(|_| format!("invalid {attribute} value '{raw}'")),
    }
}

fn parse_element(node: Node<'_, '_>, global: bool) -> Result<ElementDecl, String> {
    if node.attribute("ref").is_some() {
        return Err(unsupported("element ref"));
    }
    let name = required_attribute(node, "name")?.to_string();

    let (min_occurs, max_occurs) = if global {
        (1, MaxOccurs::Bounded(1))
    } else {
        let min = parse_occurs(node.attribute("minOccurs"), "minOccurs")?;
        let max = match node.attribute("maxOccurs") {
            Some("unbounded") => MaxOccurs::Unbounded,
            other => MaxOccurs::Bounded(parse_occurs(other, "maxOccurs")?),
        };
        if let MaxOccurs::Bounded(max) = max {
            if max < min {
                return Err(format!("element '{name}': maxOccurs is smaller than minOccurs"));
            }
        }
        (min, max)
    };

    let mut type_ref = node
        .attribute("type")
        .map(|qname| resolve_qname(node, qname))
        .transpose()?;

    for child in element_children(node) {
        let inline = match xsd_name(child)? {
            "annotation" => continue,
            "complexType" => TypeRef::Complex(Box::new(parse_complex_type(child)?)),
            "simpleType" => TypeRef::Simple(Box::new(parse_simple_type(child)?)),
            other => return Err(unsupported(other)),
        };
        if type_ref.is_some() {
            return Err(format!("element '{name}' declares more than one type"));
        }
        type_ref = Some(inline);
    }

    let type_ref = type_ref.ok_or_else(|| format!("element '{name}' declares no type"))?;
    Ok(ElementDecl {
        name,
        type_ref,
        min_occurs,
        max_occurs,
    })
}

fn parse_complex_type(node: Node<'_, '_>) -> Result<ComplexType, String> {
    if matches!(node.attribute("mixed"), Some("true") | Some("1")) {
        return Err(unsupported("mixed content"));
    }

    let mut content = None;
    let mut attributes = Vec::new();
    for child in element_children(node) {
        let parsed = match xsd_name(child)? {
            "annotation" => continue,
            "attribute" => {
                attributes.push(parse_attribute(child)?);
                continue;
            }
            "sequence" => Content::Sequence(parse_sequence(child)?),
            "simpleContent" => {
                let (base, extra) = parse_simple_content(child)?;
                attributes.extend(extra);
                Content::Simple(base)
            }
            other => return Err(unsupported(other)),
        };
        if content.is_some() {
            return Err("complex type declares more than one content model".to_string());
        }
        content = Some(parsed);
    }

    Ok(ComplexType {
        content: content.unwrap_or(Content::Empty),
        attributes,
    })
}

fn parse_sequence(node: Node<'_, '_>) -> Result<Vec<ElementDecl>, String> {
    for attribute in ["minOccurs", "maxOccurs"] {
        if matches!(node.attribute(attribute), Some(value) if value != "1") {
            return Err(unsupported("repeated sequence"));
        }
    }

    let mut particles = Vec::new();
    for child in element_children(node) {
        match xsd_name(child)? {
            "annotation" => {}
            "element" => particles.push(parse_element(child, false)?),
            other => return Err(unsupported(other)),
        }
    }
    Ok(particles)
}

fn parse_simple_content(node: Node<'_, '_>) -> Result<(TypeRef, Vec<AttributeDecl>), String> {
    let mut result = None;
    for child in element_children(node) {
        match xsd_name(child)? {
            "annotation" => {}
            "extension" => {
                let base = resolve_qname(child, required_attribute(child, "base")?)?;
                let mut attributes = Vec::new();
                for grandchild in element_children(child) {
                    match xsd_name(grandchild)? {
                        "annotation" => {}
                        "attribute" => attributes.push(parse_attribute(grandchild)?),
                        other => return Err(unsupported(other)),
                    }
                }
                result = Some((base, attributes));
            }
            other => return Err(unsupported(other)),
        }
    }
    result.ok_or_else(|| "xs:simpleContent without xs:extension".to_string())
}

fn parse_attribute(node: Node<'_, '_>) -> Result<AttributeDecl, String> {
    if node.attribute("ref").is_some() {
        return Err(unsupported("attribute ref"));
    }
    let name = required_attribute(node, "name")?.to_string();
    let required = match node.attribute("use") {
        None | Some("optional") => false,
        Some("required") => true,
        Some(other) => return Err(unsupported(&format!("attribute use '{other}'"))),
    };

    let mut type_ref = node
        .attribute("type")
        .map(|qname| resolve_qname(node, qname))
        .transpose()?;
    for child in element_children(node) {
        match xsd_name(child)? {
            "annotation" => {}
            "simpleType" if type_ref.is_none() => {
                type_ref = Some(TypeRef::Simple(Box::new(parse_simple_type(child)?)))
            }
            other => return Err(unsupported(other)),
        }
    }

    Ok(AttributeDecl {
        name,
        type_ref: type_ref.unwrap_or(TypeRef::Builtin(Builtin::String)),
        required,
    })
}

fn parse_simple_type(node: Node<'_, '_>) -> Result<SimpleType, String> {
    let mut restriction = None;
    for child in element_children(node) {
        match xsd_name(child)? {
            "annotation" => {}
            "restriction" => restriction = Some(parse_restriction(child)?),
            other => return Err(unsupported(other)),
        }
    }
    restriction.ok_or_else(|| "xs:simpleType without xs:restriction".to_string())
}

fn parse_restriction(node: Node<'_, '_>) -> Result<SimpleType, String> {
    let mut base = node
        .attribute("base")
        .map(|qname| resolve_qname(node, qname))
        .transpose()?;
    let mut facets = Facets::default();

    for child in element_children(node) {
        let name = xsd_name(child)?;
        if name == "annotation" {
            continue;
        }
        if name == "simpleType" {
            if base.is_some() {
                return Err("xs:restriction declares more than one base type".to_string());
            }
            base = Some(TypeRef::Simple(Box::new(parse_simple_type(child)?)));
            continue;
        }

        let value = required_attribute(child, "value")?;
        match name {
            "pattern" => {
                let regex = Regex::new(&format!("^(?:{value})$"))
                    .map_err(|e| format!("invalid pattern '{value}': {e}"))?;
                facets.patterns.push(Pattern {
                    source: value.to_string(),
                    regex,
                });
            }
            "enumeration" => facets.enumeration.push(value.to_string()),
            "length" => facets.length = Some(parse_length(name, value)?),
            "minLength" => facets.min_length = Some(parse_length(name, value)?),
            "maxLength" => facets.max_length = Some(parse_length(name, value)?),
            "minInclusive" => facets.min_inclusive = Some(parse_bound(name, value)?),
            "maxInclusive" => facets.max_inclusive = Some(parse_bound(name, value)?),
            other => return Err(unsupported(other)),
        }
    }

    let base = base.ok_or_else(|| "xs:restriction without a base type".to_string())?;
    Ok(SimpleType { base, facets })
}

fn parse_length(facet: &str, value: &str) -> Result<usize, String> {
    value
        .trim()
        .parse()
        .map_err(|_| format!("invalid {facet} value '{value}'"))
}

fn parse_bound(facet: &str, value: &str) -> Result<i128, String> {
    parse_integer(value.trim()).ok_or_else(|| format!("{facet} only supports integer bounds, got '{value}'"))
}
