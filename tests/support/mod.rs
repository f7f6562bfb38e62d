#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ggen_sync::config::{CONFIG_FILE_NAME, Workspace};
use ggen_sync::{SyncEngine, SyncOptions, SyncReport};
use tempfile::TempDir;

pub const CLI_SPEC: &str = r#"
@prefix ex: <http://example.org/cli#> .
@prefix rdfs: <http://www.w3.org/2000/01/rdf-schema#> .

ex:validate a ex:Command ;
    rdfs:label "validate" ;
    ex:arg ex:validate_path .

ex:validate_path a ex:Argument ;
    rdfs:label "path" ;
    ex:argType "Path" ;
    ex:required true .
"#;

/// The same command without its required label.
pub const CLI_SPEC_UNLABELLED: &str = r#"
@prefix ex: <http://example.org/cli#> .
@prefix rdfs: <http://www.w3.org/2000/01/rdf-schema#> .

ex:validate a ex:Command ;
    ex:arg ex:validate_path .

ex:validate_path a ex:Argument ;
    rdfs:label "path" ;
    ex:argType "Path" ;
    ex:required true .
"#;

pub const CLI_SHAPES: &str = r#"
@prefix ex: <http://example.org/cli#> .
@prefix rdfs: <http://www.w3.org/2000/01/rdf-schema#> .
@prefix sh: <http://www.w3.org/ns/shacl#> .

ex:CommandShape a sh:NodeShape ;
    sh:targetClass ex:Command ;
    sh:property [
        sh:path rdfs:label ;
        sh:minCount 1 ;
        sh:maxCount 1 ;
        sh:message "command requires exactly one label"
    ] .
"#;

pub const COMMANDS_QUERY: &str = r#"
PREFIX ex: <http://example.org/cli#>
PREFIX rdfs: <http://www.w3.org/2000/01/rdf-schema#>
SELECT ?command ?arg ?type WHERE {
    ?c a ex:Command ; rdfs:label ?command ; ex:arg ?a .
    ?a rdfs:label ?arg ; ex:argType ?type .
}
ORDER BY ?command ?arg
"#;

pub const NAMES_QUERY: &str = r#"
PREFIX ex: <http://example.org/cli#>
PREFIX rdfs: <http://www.w3.org/2000/01/rdf-schema#>
SELECT ?command WHERE { ?c a ex:Command ; rdfs:label ?command } ORDER BY ?command
"#;

pub const COMMAND_TEMPLATE: &str = "// @generated by ggen-sync\n\
pub struct {{ item.command | pascal_case }}Args {\n\
{% for a in item.args %}    pub {{ a.arg | snake_case }}: {{ a.type | rust_type }},\n{% endfor %}\
}\n";

pub const DOCS_TEMPLATE: &str = "# Commands\n\n{% for row in rows %}- `{{ row.command }}`\n{% endfor %}";

pub const CONFIG: &str = r#"
[project]
name = "cli"

[[targets]]
name = "commands"
source = "spec/cli.ttl"
shapes = ["spec/shapes.ttl"]
query = "queries/commands.rq"
template = "templates/command.rs.tera"
output = "src/commands/{command|snake_case}.rs"
group = { key = "command", children = "args", fields = ["arg", "type"] }

[[targets]]
name = "docs"
source = "spec/cli.ttl"
query = "queries/names.rq"
template = "templates/docs.md.tera"
output = "docs/commands.md"
"#;

/// A temporary workspace laid out like a small CLI project.
pub struct Fixture {
    pub dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(CONFIG)
    }

    pub fn with_config(config: &str) -> Self {
        let fixture = Self {
            dir: TempDir::new().expect("tempdir"),
        };
        fixture.write("spec/cli.ttl", CLI_SPEC);
        fixture.write("spec/shapes.ttl", CLI_SHAPES);
        fixture.write("queries/commands.rq", COMMANDS_QUERY);
        fixture.write("queries/names.rq", NAMES_QUERY);
        fixture.write("templates/command.rs.tera", COMMAND_TEMPLATE);
        fixture.write("templates/docs.md.tera", DOCS_TEMPLATE);
        fixture.write(CONFIG_FILE_NAME, config);
        fixture
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    pub fn write(&self, relative: &str, contents: &str) {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create dir");
        }
        fs::write(path, contents).expect("write fixture file");
    }

    pub fn read(&self, relative: &str) -> String {
        fs::read_to_string(self.path(relative)).expect("read fixture file")
    }

    pub fn workspace(&self) -> Arc<Workspace> {
        Arc::new(Workspace::load(self.path(CONFIG_FILE_NAME)).expect("load workspace"))
    }

    pub fn engine(&self) -> SyncEngine {
        SyncEngine::new(self.workspace())
    }

    pub async fn sync(&self) -> SyncReport {
        self.engine()
            .sync(SyncOptions::default())
            .await
            .expect("sync run")
    }

    pub fn receipt(&self, output: &str) -> PathBuf {
        self.path(&format!(".ggen/receipts/{output}.receipt.json"))
    }
}
