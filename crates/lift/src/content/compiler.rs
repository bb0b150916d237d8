use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use roxmltree::{Document, Node};

use crate::types::Vec3;

use super::catalog::{
    AvatarTemplate, AvatarTemplateId, Capability, TemplateCatalog, WorldTemplate,
    WorldTemplateId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogErrorCode {
    ReadFile,
    XmlMalformed,
    InvalidRoot,
    UnknownTemplateType,
    UnknownField,
    DuplicateField,
    MissingField,
    InvalidValue,
    DuplicateTemplate,
}

#[derive(Debug, Clone)]
pub struct CatalogError {
    pub code: CatalogErrorCode,
    pub message: String,
    pub file_path: PathBuf,
    pub location: Option<SourceLocation>,
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location {
            Some(loc) => write!(
                f,
                "{:?}: {} (file={}, line={}, column={})",
                self.code,
                self.message,
                self.file_path.display(),
                loc.line,
                loc.column
            ),
            None => write!(
                f,
                "{:?}: {} (file={})",
                self.code,
                self.message,
                self.file_path.display()
            ),
        }
    }
}

impl std::error::Error for CatalogError {}

/// Reads every `*.xml` file under `templates_dir` in sorted relative-path
/// order and builds one catalog. A template name may be declared once across
/// all files.
pub fn load_template_catalog(templates_dir: &Path) -> Result<TemplateCatalog, CatalogError> {
    let xml_files = collect_xml_files_sorted(templates_dir)
        .map_err(|error| read_error(error.path, error.source))?;

    let mut avatars = Vec::<AvatarTemplate>::new();
    let mut worlds = Vec::<WorldTemplate>::new();
    let mut seen_names = HashSet::<String>::new();

    for xml_file in xml_files {
        let raw = fs::read_to_string(&xml_file)
            .map_err(|source| read_error(xml_file.clone(), source))?;
        let parsed = parse_templates_document(&xml_file, &raw)?;
        for template in parsed {
            let name = template.name().to_string();
            if !seen_names.insert(name.clone()) {
                return Err(CatalogError {
                    code: CatalogErrorCode::DuplicateTemplate,
                    message: format!("template '{name}' is declared more than once"),
                    file_path: xml_file.clone(),
                    location: None,
                });
            }
            match template {
                ParsedTemplate::Avatar(avatar) => avatars.push(avatar),
                ParsedTemplate::World(world) => worlds.push(world),
            }
        }
    }

    Ok(TemplateCatalog::from_templates(avatars, worlds))
}

#[derive(Debug)]
enum ParsedTemplate {
    Avatar(AvatarTemplate),
    World(WorldTemplate),
}

impl ParsedTemplate {
    fn name(&self) -> &str {
        match self {
            Self::Avatar(avatar) => &avatar.name,
            Self::World(world) => &world.name,
        }
    }
}

fn parse_templates_document(
    file_path: &Path,
    raw: &str,
) -> Result<Vec<ParsedTemplate>, CatalogError> {
    let doc = Document::parse(raw).map_err(|error| CatalogError {
        code: CatalogErrorCode::XmlMalformed,
        message: format!("malformed XML: {error}"),
        file_path: file_path.to_path_buf(),
        location: Some(SourceLocation {
            line: error.pos().row as usize,
            column: error.pos().col as usize,
        }),
    })?;

    let root = doc.root_element();
    if root.tag_name().name() != "Templates" {
        return Err(error_at_node(
            CatalogErrorCode::InvalidRoot,
            "root element must be <Templates>".to_string(),
            file_path,
            &doc,
            root,
        ));
    }

    let mut templates = Vec::new();
    for child in root.children().filter(|node| node.is_element()) {
        match child.tag_name().name() {
            "AvatarTemplate" => templates.push(ParsedTemplate::Avatar(parse_avatar_template(
                file_path, &doc, child,
            )?)),
            "WorldTemplate" => templates.push(ParsedTemplate::World(parse_world_template(
                file_path, &doc, child,
            )?)),
            other => {
                return Err(error_at_node(
                    CatalogErrorCode::UnknownTemplateType,
                    format!(
                        "unsupported template type <{other}>; expected <AvatarTemplate> or <WorldTemplate>"
                    ),
                    file_path,
                    &doc,
                    child,
                ))
            }
        }
    }
    Ok(templates)
}

fn parse_avatar_template(
    file_path: &Path,
    doc: &Document<'_>,
    node: Node<'_, '_>,
) -> Result<AvatarTemplate, CatalogError> {
    let mut seen_fields = HashSet::<String>::new();
    let mut name: Option<String> = None;
    let mut capabilities = BTreeSet::<Capability>::new();

    for field in node.children().filter(|child| child.is_element()) {
        let field_name = field.tag_name().name().to_string();
        if !seen_fields.insert(field_name.clone()) {
            return Err(error_at_node(
                CatalogErrorCode::DuplicateField,
                format!("duplicate field <{field_name}> in <AvatarTemplate>"),
                file_path,
                doc,
                field,
            ));
        }
        match field_name.as_str() {
            "name" => name = Some(required_text(file_path, doc, field, "name")?),
            "capabilities" => {
                // An empty list is legal; the spawner rejects the template later.
                let raw = field.text().unwrap_or_default();
                for entry in raw.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
                    let Some(capability) = Capability::parse(entry) else {
                        return Err(error_at_node(
                            CatalogErrorCode::InvalidValue,
                            format!(
                                "unknown capability '{entry}'; allowed values: movement_control, replicated_transform, network_identity"
                            ),
                            file_path,
                            doc,
                            field,
                        ));
                    };
                    capabilities.insert(capability);
                }
            }
            _ => {
                return Err(error_at_node(
                    CatalogErrorCode::UnknownField,
                    format!("unknown field <{field_name}> in <AvatarTemplate>"),
                    file_path,
                    doc,
                    field,
                ))
            }
        }
    }

    let Some(name) = name else {
        return Err(error_at_node(
            CatalogErrorCode::MissingField,
            "missing required field <name> in <AvatarTemplate>".to_string(),
            file_path,
            doc,
            node,
        ));
    };

    Ok(AvatarTemplate {
        id: AvatarTemplateId(0),
        name,
        capabilities,
    })
}

fn parse_world_template(
    file_path: &Path,
    doc: &Document<'_>,
    node: Node<'_, '_>,
) -> Result<WorldTemplate, CatalogError> {
    let mut seen_fields = HashSet::<String>::new();
    let mut name: Option<String> = None;
    let mut spawn_point: Option<Vec3> = None;

    for field in node.children().filter(|child| child.is_element()) {
        let field_name = field.tag_name().name().to_string();
        if !seen_fields.insert(field_name.clone()) {
            return Err(error_at_node(
                CatalogErrorCode::DuplicateField,
                format!("duplicate field <{field_name}> in <WorldTemplate>"),
                file_path,
                doc,
                field,
            ));
        }
        match field_name.as_str() {
            "name" => name = Some(required_text(file_path, doc, field, "name")?),
            "spawnPoint" => {
                spawn_point = Some(Vec3 {
                    x: coordinate_attr(file_path, doc, field, "x")?,
                    y: coordinate_attr(file_path, doc, field, "y")?,
                    z: coordinate_attr(file_path, doc, field, "z")?,
                })
            }
            _ => {
                return Err(error_at_node(
                    CatalogErrorCode::UnknownField,
                    format!("unknown field <{field_name}> in <WorldTemplate>"),
                    file_path,
                    doc,
                    field,
                ))
            }
        }
    }

    let Some(name) = name else {
        return Err(error_at_node(
            CatalogErrorCode::MissingField,
            "missing required field <name> in <WorldTemplate>".to_string(),
            file_path,
            doc,
            node,
        ));
    };

    Ok(WorldTemplate {
        id: WorldTemplateId(0),
        name,
        spawn_point: spawn_point.unwrap_or_default(),
    })
}

fn coordinate_attr(
    file_path: &Path,
    doc: &Document<'_>,
    node: Node<'_, '_>,
    attr: &str,
) -> Result<f32, CatalogError> {
    let Some(raw) = node.attribute(attr) else {
        return Ok(0.0);
    };
    match raw.trim().parse::<f32>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(error_at_node(
            CatalogErrorCode::InvalidValue,
            format!("spawnPoint {attr} '{raw}' is not a finite number"),
            file_path,
            doc,
            node,
        )),
    }
}

fn required_text(
    file_path: &Path,
    doc: &Document<'_>,
    node: Node<'_, '_>,
    field_name: &str,
) -> Result<String, CatalogError> {
    let value = node.text().map(str::trim).unwrap_or_default().to_string();
    if value.is_empty() {
        return Err(error_at_node(
            CatalogErrorCode::MissingField,
            format!("field <{field_name}> must not be empty"),
            file_path,
            doc,
            node,
        ));
    }
    Ok(value)
}

fn error_at_node(
    code: CatalogErrorCode,
    message: String,
    file_path: &Path,
    doc: &Document<'_>,
    node: Node<'_, '_>,
) -> CatalogError {
    let pos = doc.text_pos_at(node.range().start);
    CatalogError {
        code,
        message,
        file_path: file_path.to_path_buf(),
        location: Some(SourceLocation {
            line: pos.row as usize,
            column: pos.col as usize,
        }),
    }
}

struct ReadError {
    path: PathBuf,
    source: std::io::Error,
}

fn collect_xml_files_sorted(root: &Path) -> Result<Vec<PathBuf>, ReadError> {
    let mut files = Vec::<PathBuf>::new();
    collect_recursive(root, &mut files)?;
    files.sort_by_key(|path| normalize_rel_path(path.strip_prefix(root).unwrap_or(path.as_path())));
    Ok(files)
}

fn collect_recursive(current: &Path, files: &mut Vec<PathBuf>) -> Result<(), ReadError> {
    let entries = fs::read_dir(current).map_err(|source| ReadError {
        path: current.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| ReadError {
            path: current.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            collect_recursive(&path, files)?;
        } else if path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("xml"))
        {
            files.push(path);
        }
    }
    Ok(())
}

fn normalize_rel_path(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

fn read_error(path: PathBuf, source: std::io::Error) -> CatalogError {
    CatalogError {
        code: CatalogErrorCode::ReadFile,
        message: format!("failed to read template file: {source}"),
        file_path: path,
        location: None,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    fn write_file(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, content).expect("write");
    }

    #[test]
    fn valid_catalog_resolves_templates_across_files() {
        let temp = TempDir::new().expect("temp");
        write_file(
            &temp.path().join("a_avatars.xml"),
            r#"<Templates>
                <AvatarTemplate>
                    <name>player</name>
                    <capabilities>network_identity, movement_control, replicated_transform</capabilities>
                </AvatarTemplate>
            </Templates>"#,
        );
        write_file(
            &temp.path().join("nested").join("b_worlds.xml"),
            r#"<Templates>
                <WorldTemplate><name>Lobby</name></WorldTemplate>
                <WorldTemplate><name>Game</name><spawnPoint x="1.5" y="0" z="-2"/></WorldTemplate>
            </Templates>"#,
        );

        let catalog = load_template_catalog(temp.path()).expect("catalog");
        let player = catalog
            .avatar(catalog.avatar_id_by_name("player").expect("player id"))
            .expect("player");
        assert_eq!(player.missing_capability(), None);

        let game_id = catalog.world_id_by_name("Game").expect("game id");
        assert_eq!(game_id, WorldTemplateId(1));
        let game = catalog.world(game_id).expect("game");
        assert_eq!(
            game.spawn_point,
            Vec3 {
                x: 1.5,
                y: 0.0,
                z: -2.0
            }
        );
    }

    #[test]
    fn unknown_capability_is_invalid_value() {
        let temp = TempDir::new().expect("temp");
        write_file(
            &temp.path().join("t.xml"),
            r#"<Templates><AvatarTemplate><name>p</name><capabilities>flight</capabilities></AvatarTemplate></Templates>"#,
        );
        let err = load_template_catalog(temp.path()).expect_err("err");
        assert_eq!(err.code, CatalogErrorCode::InvalidValue);
        assert!(err.location.is_some());
    }

    #[test]
    fn missing_name_reports_location() {
        let temp = TempDir::new().expect("temp");
        write_file(
            &temp.path().join("t.xml"),
            r#"<Templates><WorldTemplate><spawnPoint x="0"/></WorldTemplate></Templates>"#,
        );
        let err = load_template_catalog(temp.path()).expect_err("err");
        assert_eq!(err.code, CatalogErrorCode::MissingField);
        assert!(err.file_path.ends_with("t.xml"));
        assert!(err.location.is_some());
    }

    #[test]
    fn duplicate_name_across_files_errors() {
        let temp = TempDir::new().expect("temp");
        write_file(
            &temp.path().join("a.xml"),
            r#"<Templates><WorldTemplate><name>Game</name></WorldTemplate></Templates>"#,
        );
        write_file(
            &temp.path().join("b.xml"),
            r#"<Templates><WorldTemplate><name>Game</name></WorldTemplate></Templates>"#,
        );
        let err = load_template_catalog(temp.path()).expect_err("err");
        assert_eq!(err.code, CatalogErrorCode::DuplicateTemplate);
    }

    #[test]
    fn wrong_root_and_malformed_xml_error() {
        let temp = TempDir::new().expect("temp");
        write_file(&temp.path().join("t.xml"), r#"<Defs></Defs>"#);
        let err = load_template_catalog(temp.path()).expect_err("err");
        assert_eq!(err.code, CatalogErrorCode::InvalidRoot);

        write_file(
            &temp.path().join("t.xml"),
            r#"<Templates><WorldTemplate></Templates>"#,
        );
        let err = load_template_catalog(temp.path()).expect_err("err");
        assert_eq!(err.code, CatalogErrorCode::XmlMalformed);
    }

    #[test]
    fn missing_directory_is_read_error() {
        let temp = TempDir::new().expect("temp");
        let err = load_template_catalog(&temp.path().join("absent")).expect_err("err");
        assert_eq!(err.code, CatalogErrorCode::ReadFile);
    }
}
