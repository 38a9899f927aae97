use roxmltree::{Document, Node};

use super::model::{
    element_children, AttributeDecl, ComplexType, Content, ElementDecl, Resolved, TypeRef,
    XsdModel, XSI_NAMESPACE,
};

/// 按模型校验实例文档，返回第一条诊断信息
pub(crate) fn validate_document(model: &XsdModel, document: &Document<'_>) -> Result<(), String> {
    let root = document.root_element();
    let declaration = model
        .global_element(root.tag_name().name())
        .filter(|_| root.tag_name().namespace() == model.target_namespace.as_deref())
        .ok_or_else(|| {
            format!(
                "Element '{}': No matching global declaration available for the validation root.",
                qualified_name(root)
            )
        })?;
    validate_element(model, root, declaration)
}

fn qualified_name(node: Node<'_, '_>) -> String {
    match node.tag_name().namespace() {
        Some(namespace) => format!("{{{namespace}}}{}", node.tag_name().name()),
        None => node.tag_name().name().to_string(),
    }
}

fn validate_element(model: &XsdModel, node: Node<'_, '_>, declaration: &ElementDecl) -> Result<(), String> {
    let name = declaration.name.as_str();
    match model.resolve(&declaration.type_ref)? {
        Resolved::Complex(complex) => validate_complex(model, node, name, complex),
        Resolved::Builtin(_) | Resolved::Simple(_) => {
            check_attributes(model, node, name, &[])?;
            reject_element_children(node, name)?;
            check_simple_value(model, &declaration.type_ref, &text_content(node))
                .map_err(|reason| format!("Element '{name}': {reason}"))
        }
    }
}

fn validate_complex(
    model: &XsdModel,
    node: Node<'_, '_>,
    name: &str,
    complex: &ComplexType,
) -> Result<(), String> {
    check_attributes(model, node, name, &complex.attributes)?;

    match &complex.content {
        Content::Empty => {
            if let Some(child) = element_children(node).next() {
                return Err(format!(
                    "Element '{}': This element is not expected.",
                    child.tag_name().name()
                ));
            }
            if has_character_content(node) {
                return Err(format!(
                    "Element '{name}': Character content is not allowed, because the content type is empty."
                ));
            }
            Ok(())
        }
        Content::Simple(type_ref) => {
            reject_element_children(node, name)?;
            check_simple_value(model, type_ref, &text_content(node))
                .map_err(|reason| format!("Element '{name}': {reason}"))
        }
        Content::Sequence(particles) => {
            if has_character_content(node) {
                return Err(format!(
                    "Element '{name}': Character content other than whitespace is not allowed because the content type is 'element-only'."
                ));
            }
            validate_sequence(model, node, name, particles)
        }
    }
}

fn validate_sequence(
    model: &XsdModel,
    node: Node<'_, '_>,
    name: &str,
    particles: &[ElementDecl],
) -> Result<(), String> {
    let children: Vec<Node<'_, '_>> = element_children(node).collect();
    let mut position = 0;

    for particle in particles {
        let mut count = 0u32;
        while let Some(child) = children.get(position) {
            if child.tag_name().name() != particle.name || !particle.max_occurs.allows(count + 1) {
                break;
            }
            validate_element(model, *child, particle)?;
            count += 1;
            position += 1;
        }

        if count < particle.min_occurs {
            return Err(match children.get(position) {
                Some(child) => format!(
                    "Element '{}': This element is not expected. Expected is ( {} ).",
                    child.tag_name().name(),
                    particle.name
                ),
                None => format!(
                    "Element '{name}': Missing child element(s). Expected is ( {} ).",
                    particle.name
                ),
            });
        }
    }

    if let Some(child) = children.get(position) {
        return Err(format!(
            "Element '{}': This element is not expected.",
            child.tag_name().name()
        ));
    }
    Ok(())
}

fn check_attributes(
    model: &XsdModel,
    node: Node<'_, '_>,
    name: &str,
    declarations: &[AttributeDecl],
) -> Result<(), String> {
    for attribute in node.attributes() {
        // xsi:schemaLocation 等实例属性不参与校验
        if attribute.namespace() == Some(XSI_NAMESPACE) {
            continue;
        }
        let attribute_name = attribute.name();
        let declaration = declarations
            .iter()
            .find(|decl| attribute.namespace().is_none() && decl.name == attribute_name)
            .ok_or_else(|| {
                format!(
                    "Element '{name}', attribute '{attribute_name}': The attribute '{attribute_name}' is not allowed."
                )
            })?;
        check_simple_value(model, &declaration.type_ref, attribute.value())
            .map_err(|reason| format!("Element '{name}', attribute '{attribute_name}': {reason}"))?;
    }

    for declaration in declarations.iter().filter(|decl| decl.required) {
        if node.attribute(declaration.name.as_str()).is_none() {
            return Err(format!(
                "Element '{name}': The attribute '{}' is required but missing.",
                declaration.name
            ));
        }
    }
    Ok(())
}

fn check_simple_value(model: &XsdModel, type_ref: &TypeRef, raw: &str) -> Result<(), String> {
    match model.resolve(type_ref)? {
        Resolved::Builtin(builtin) => {
            let value = builtin.normalize(raw);
            if builtin.accepts(&value) {
                Ok(())
            } else {
                Err(format!(
                    "'{value}' is not a valid value of the atomic type '{}'.",
                    builtin.name()
                ))
            }
        }
        Resolved::Simple(simple) => {
            // 先满足基类型，再检查本层 facet
            check_simple_value(model, &simple.base, raw)?;
            let primitive = model.primitive_of(&simple.base)?;
            simple.facets.check(&primitive.normalize(raw))
        }
        Resolved::Complex(_) => Err("a complex type is used where a simple value is expected.".to_string()),
    }
}

fn reject_element_children(node: Node<'_, '_>, name: &str) -> Result<(), String> {
    if element_children(node).next().is_some() {
        return Err(format!(
            "Element '{name}': Element content is not allowed, because the content type is a simple type."
        ));
    }
    Ok(())
}

fn has_character_content(node: Node<'_, '_>) -> bool {
    node.children()
        .filter(|child| child.is_text())
        .filter_map(|child| child.text())
        .any(|text| !text.trim().is_empty())
}

fn text_content(node: Node<'_, '_>) -> String {
    node.children()
        .filter(|child| child.is_text())
        .filter_map(|child| child.text())
        .collect()
}
