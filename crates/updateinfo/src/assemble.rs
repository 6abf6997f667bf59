//! DB-free assembly of the `updateinfo.xml` document.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Utc};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use errata_sql::advisories::AdvisoryPackageRow;
use errata_sql::AdvisoryKind;

use crate::{AdvisoryContext, Error, UpdateinfoMeta};

/// The `<update type>` attribute for an advisory kind. One of the two
/// places the kind is exhaustively analyzed.
pub fn update_type(kind: AdvisoryKind) -> &'static str {
    match kind {
        AdvisoryKind::Security => "security",
        AdvisoryKind::BugFix => "bugfix",
        AdvisoryKind::Enhancement => "enhancement",
    }
}

/// Lowercase, hyphen-separated form of a collection name.
pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_dash = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}

const SKIP_SUFFIXES: &[&str] = &[
    "-debuginfo",
    "-debugsource",
    "-debuginfo-common",
    "-debugsource-common",
];

struct ParsedNevra<'a> {
    name: &'a str,
    epoch: String,
    version: &'a str,
    release: &'a str,
    arch: &'a str,
}

fn split_nevra(nevra: &str) -> Option<ParsedNevra<'_>> {
    let trimmed = nevra.strip_suffix(".rpm").unwrap_or(nevra);
    let (rest, arch) = trimmed.rsplit_once('.')?;
    let (nvr, release) = rest.rsplit_once('-')?;
    let (name, version) = nvr.rsplit_once('-')?;
    let (epoch, version) = match version.split_once(':') {
        Some((epoch, version)) => (epoch.to_string(), version),
        None => ("0".to_string(), version),
    };
    Some(ParsedNevra {
        name,
        epoch,
        version,
        release,
        arch,
    })
}

/// Packages group by source name; modular packages additionally by
/// their module name and stream, so parallel streams stay apart.
fn group_key(package: &AdvisoryPackageRow) -> String {
    match &package.module_name {
        Some(module) => format!(
            "{module}:{}:{}",
            package.package_name,
            package.module_stream.as_deref().unwrap_or(""),
        ),
        None => package.package_name.clone(),
    }
}

/// Resolve each group's source RPM filename from the advisory's own
/// `src`-arch package rows. Groups without one are later dropped.
fn source_rpms(packages: &[AdvisoryPackageRow]) -> HashMap<String, String> {
    let mut groups: HashMap<String, Vec<&AdvisoryPackageRow>> = HashMap::new();
    for package in packages {
        groups.entry(group_key(package)).or_default().push(package);
    }

    let mut sources = HashMap::new();
    for (key, members) in groups {
        for member in members {
            let Some(parsed) = split_nevra(&member.nevra) else {
                continue;
            };
            if parsed.arch == "src" && parsed.name == member.package_name {
                sources.insert(
                    key,
                    format!(
                        "{}-{}-{}.{}.rpm",
                        parsed.name, parsed.version, parsed.release, parsed.arch
                    ),
                );
                break;
            }
        }
    }
    sources
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ModuleInfo {
    name: String,
    stream: String,
    version: String,
    context: String,
}

#[derive(Debug)]
struct Collection {
    short: String,
    module: Option<ModuleInfo>,
    packages: Vec<Emitted>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Emitted {
    name: String,
    arch: String,
    epoch: String,
    version: String,
    release: String,
    src: String,
    filename: String,
    checksum: String,
    checksum_type: String,
}

fn emit_package(
    package: &AdvisoryPackageRow,
    sources: &HashMap<String, String>,
    product_arch: &str,
) -> Option<Emitted> {
    if package.nevra.ends_with(".src.rpm") {
        return None;
    }
    let parsed = split_nevra(&package.nevra)?;
    let src = sources.get(&group_key(package))?;

    if parsed.arch != product_arch && parsed.arch != "noarch" {
        if !(product_arch == "x86_64" && parsed.arch == "i686") {
            return None;
        }
    }
    if SKIP_SUFFIXES
        .iter()
        .any(|suffix| parsed.name.ends_with(suffix))
    {
        return None;
    }

    Some(Emitted {
        name: parsed.name.to_string(),
        arch: parsed.arch.to_string(),
        epoch: parsed.epoch.clone(),
        version: parsed.version.to_string(),
        release: parsed.release.to_string(),
        src: src.clone(),
        filename: format!(
            "{}-{}-{}.{}.rpm",
            parsed.name, parsed.version, parsed.release, parsed.arch
        ),
        checksum: package.checksum.clone(),
        checksum_type: package.checksum_type.clone(),
    })
}

/// Partition an advisory's packages into collections. Modular packages
/// go into one collection per module name; their presence suppresses
/// the default collection entirely, because DNF treats a collection
/// with a `<module>` child as an atomic set and mixing module and
/// non-module RPMs misleads its solver.
fn build_collections(context: &AdvisoryContext, base: &str, repo: &str) -> Vec<Collection> {
    let sources = source_rpms(&context.packages);

    let mut eligible: Vec<&AdvisoryPackageRow> = Vec::new();
    for package in &context.packages {
        // Read-side integrity check: a package row whose product
        // disagrees with the affected-product row must never be served.
        if package.supported_product_id != context.supported_product_id {
            tracing::error!(
                advisory = %context.advisory.name,
                nevra = %package.nevra,
                package_product = package.supported_product_id,
                affected_product = context.supported_product_id,
                "cross-product package row; skipping"
            );
            continue;
        }
        if package.repo_name != repo {
            continue;
        }
        eligible.push(package);
    }

    let has_modular = eligible.iter().any(|p| p.module_name.is_some());
    let mut collections: Vec<Collection> = Vec::new();
    let mut by_short: HashMap<String, usize> = HashMap::new();

    for package in eligible {
        let (short, module) = match &package.module_name {
            Some(module_name) => (
                format!("{base}__{module_name}"),
                Some(ModuleInfo {
                    name: module_name.clone(),
                    stream: package.module_stream.clone().unwrap_or_default(),
                    version: package.module_version.clone().unwrap_or_default(),
                    context: package.module_context.clone().unwrap_or_default(),
                }),
            ),
            None => {
                if has_modular {
                    continue;
                }
                (base.to_string(), None)
            }
        };

        let position = match by_short.get(&short) {
            Some(&position) => position,
            None => {
                collections.push(Collection {
                    short: short.clone(),
                    module,
                    packages: Vec::new(),
                });
                by_short.insert(short, collections.len() - 1);
                collections.len() - 1
            }
        };
        if let Some(emitted) = emit_package(package, &sources, &context.arch) {
            collections[position].packages.push(emitted);
        }
    }

    collections
}

fn format_date(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

/// Assemble the `updateinfo.xml` document for a slice's advisories.
/// Advisories whose collections all end up empty are not emitted.
pub fn assemble(
    contexts: &[AdvisoryContext],
    repo: &str,
    meta: &UpdateinfoMeta,
) -> Result<String, Error> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Start(BytesStart::new("updates")))?;

    for context in contexts {
        let base = slugify(&format!("{}-{}-rpms", context.product_name, repo));
        let collections = build_collections(context, &base, repo);
        if collections.iter().all(|c| c.packages.is_empty()) {
            continue;
        }
        write_update(&mut writer, context, &collections, meta)?;
    }

    writer.write_event(Event::End(BytesEnd::new("updates")))?;
    Ok(String::from_utf8(writer.into_inner()).expect("writer emits UTF-8"))
}

fn write_update(
    writer: &mut Writer<Vec<u8>>,
    context: &AdvisoryContext,
    collections: &[Collection],
    meta: &UpdateinfoMeta,
) -> Result<(), Error> {
    let advisory = &context.advisory;

    let mut update = BytesStart::new("update");
    update.push_attribute(("from", meta.managing_editor.as_str()));
    update.push_attribute(("status", "final"));
    update.push_attribute(("type", update_type(advisory.kind)));
    update.push_attribute(("version", "2"));
    writer.write_event(Event::Start(update))?;

    writer
        .create_element("id")
        .write_text_content(BytesText::new(&advisory.name))?;
    writer
        .create_element("title")
        .write_text_content(BytesText::new(&advisory.synopsis))?;

    let issued = format_date(advisory.published_at.or(advisory.updated_at));
    writer
        .create_element("issued")
        .with_attribute(("date", issued.as_str()))
        .write_empty()?;
    let updated = format_date(advisory.updated_at.or(advisory.published_at));
    writer
        .create_element("updated")
        .with_attribute(("date", updated.as_str()))
        .write_empty()?;

    let rights = format!("Copyright {} {}", Utc::now().year(), meta.company_name);
    writer
        .create_element("rights")
        .write_text_content(BytesText::new(&rights))?;

    let mut release = format!("{} {}", context.product_name, context.major_version);
    if let Some(minor) = context.minor_version {
        release.push_str(&format!(".{minor}"));
    }
    writer
        .create_element("release")
        .write_text_content(BytesText::new(&release))?;

    writer
        .create_element("pushcount")
        .write_text_content(BytesText::new("1"))?;
    writer
        .create_element("severity")
        .write_text_content(BytesText::new(&advisory.severity))?;
    writer
        .create_element("summary")
        .write_text_content(BytesText::new(&advisory.topic))?;
    writer
        .create_element("description")
        .write_text_content(BytesText::new(&advisory.description))?;
    writer.create_element("solution").write_empty()?;

    writer.write_event(Event::Start(BytesStart::new("references")))?;
    for cve in &context.cves {
        let href = format!("https://cve.mitre.org/cgi-bin/cvename.cgi?name={cve}");
        writer
            .create_element("reference")
            .with_attributes([
                ("href", href.as_str()),
                ("id", cve.as_str()),
                ("type", "cve"),
                ("title", cve.as_str()),
            ])
            .write_empty()?;
    }
    for fix in &context.fixes {
        writer
            .create_element("reference")
            .with_attributes([
                ("href", fix.source.as_str()),
                ("id", fix.ticket_id.as_str()),
                ("type", "bugzilla"),
                ("title", fix.description.as_deref().unwrap_or("")),
            ])
            .write_empty()?;
    }
    let self_href = format!("{}/{}", meta.ui_url, advisory.name);
    writer
        .create_element("reference")
        .with_attributes([
            ("href", self_href.as_str()),
            ("id", advisory.name.as_str()),
            ("type", "self"),
            ("title", advisory.name.as_str()),
        ])
        .write_empty()?;
    writer.write_event(Event::End(BytesEnd::new("references")))?;

    writer.write_event(Event::Start(BytesStart::new("pkglist")))?;
    for collection in collections {
        if collection.packages.is_empty() {
            continue;
        }
        let mut start = BytesStart::new("collection");
        start.push_attribute(("short", collection.short.as_str()));
        writer.write_event(Event::Start(start))?;

        writer
            .create_element("name")
            .write_text_content(BytesText::new(&collection.short))?;

        if let Some(module) = &collection.module {
            writer
                .create_element("module")
                .with_attributes([
                    ("name", module.name.as_str()),
                    ("stream", module.stream.as_str()),
                    ("version", module.version.as_str()),
                    ("context", module.context.as_str()),
                    ("arch", context.arch.as_str()),
                ])
                .write_empty()?;
        }

        for package in &collection.packages {
            let mut start = BytesStart::new("package");
            start.push_attribute(("name", package.name.as_str()));
            start.push_attribute(("arch", package.arch.as_str()));
            start.push_attribute(("epoch", package.epoch.as_str()));
            start.push_attribute(("version", package.version.as_str()));
            start.push_attribute(("release", package.release.as_str()));
            start.push_attribute(("src", package.src.as_str()));
            writer.write_event(Event::Start(start))?;

            writer
                .create_element("filename")
                .write_text_content(BytesText::new(&package.filename))?;
            writer
                .create_element("sum")
                .with_attribute(("type", package.checksum_type.as_str()))
                .write_text_content(BytesText::new(&package.checksum))?;

            writer.write_event(Event::End(BytesEnd::new("package")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("collection")))?;
    }
    writer.write_event(Event::End(BytesEnd::new("pkglist")))?;

    writer.write_event(Event::End(BytesEnd::new("update")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use errata_sql::advisories::{Advisory, AdvisoryFixRow};

    fn meta() -> UpdateinfoMeta {
        UpdateinfoMeta {
            managing_editor: "releng@example.org".to_string(),
            company_name: "Example Software Foundation".to_string(),
            ui_url: "https://errata.example.org".to_string(),
        }
    }

    fn advisory(name: &str, kind: AdvisoryKind) -> Advisory {
        Advisory {
            id: 1,
            name: name.to_string(),
            synopsis: format!("Important: {name}"),
            description: "An update.".to_string(),
            kind,
            severity: "Important".to_string(),
            topic: "Topic text".to_string(),
            published_at: Some(Utc::now()),
            updated_at: Some(Utc::now()),
        }
    }

    fn package(nevra: &str, package_name: &str, repo: &str) -> AdvisoryPackageRow {
        AdvisoryPackageRow {
            advisory_id: 1,
            nevra: nevra.to_string(),
            checksum: format!("checksum-of-{package_name}"),
            checksum_type: "sha256".to_string(),
            module_name: None,
            module_stream: None,
            module_version: None,
            module_context: None,
            repo_name: repo.to_string(),
            package_name: package_name.to_string(),
            supported_product_id: 2,
        }
    }

    fn modular(mut row: AdvisoryPackageRow, module: &str, stream: &str) -> AdvisoryPackageRow {
        row.module_name = Some(module.to_string());
        row.module_stream = Some(stream.to_string());
        row.module_version = Some("9060020250101123456".to_string());
        row.module_context = Some("115a3b01".to_string());
        row
    }

    fn context(packages: Vec<AdvisoryPackageRow>) -> AdvisoryContext {
        AdvisoryContext {
            advisory: advisory("RLSA-2024:1234", AdvisoryKind::Security),
            arch: "x86_64".to_string(),
            major_version: 9,
            minor_version: None,
            supported_product_id: 2,
            product_name: "Rocky Linux".to_string(),
            cves: vec!["CVE-2024-0001".to_string()],
            fixes: vec![AdvisoryFixRow {
                advisory_id: 1,
                ticket_id: "2345".to_string(),
                source: "https://bugzilla.redhat.com/show_bug.cgi?id=2345".to_string(),
                description: Some("fix description".to_string()),
            }],
            packages,
        }
    }

    #[test]
    fn slugify_collections() {
        assert_eq!(slugify("Rocky Linux-BaseOS-rpms"), "rocky-linux-baseos-rpms");
        assert_eq!(slugify("Rocky Linux SIG Cloud"), "rocky-linux-sig-cloud");
    }

    #[test]
    fn plain_packages_land_in_the_default_collection() {
        let ctx = context(vec![
            package("bash-0:5.1.8-6.el9.1.x86_64.rpm", "bash", "BaseOS"),
            package("bash-0:5.1.8-6.el9.1.src.rpm", "bash", "BaseOS"),
        ]);
        let xml = assemble(std::slice::from_ref(&ctx), "BaseOS", &meta()).unwrap();

        assert!(xml.contains(r#"<collection short="rocky-linux-baseos-rpms">"#));
        assert!(xml.contains(r#"type="security""#));
        assert!(xml.contains(r#"src="bash-5.1.8-6.el9.1.src.rpm""#));
        assert!(xml.contains("<filename>bash-5.1.8-6.el9.1.x86_64.rpm</filename>"));
        // The source package row itself is never emitted.
        assert!(!xml.contains("<filename>bash-5.1.8-6.el9.1.src.rpm</filename>"));
    }

    #[test]
    fn module_packages_split_into_their_own_collection() {
        let ctx = context(vec![
            modular(
                package(
                    "redis-0:7.2.10-1.module+el9.6.0+23332+115a3b01.x86_64.rpm",
                    "redis",
                    "AppStream",
                ),
                "redis",
                "7",
            ),
            modular(
                package(
                    "redis-0:7.2.10-1.module+el9.6.0+23332+115a3b01.src.rpm",
                    "redis",
                    "AppStream",
                ),
                "redis",
                "7",
            ),
            // A stray non-modular package: suppressed entirely once any
            // module package is present.
            package("bash-0:5.1.8-6.el9.x86_64.rpm", "bash", "AppStream"),
            package("bash-0:5.1.8-6.el9.src.rpm", "bash", "AppStream"),
        ]);
        let xml = assemble(std::slice::from_ref(&ctx), "AppStream", &meta()).unwrap();

        assert!(xml.contains(r#"<collection short="rocky-linux-appstream-rpms__redis">"#));
        assert!(xml.contains(
            r#"<module name="redis" stream="7" version="9060020250101123456" context="115a3b01" arch="x86_64"/>"#
        ));
        assert!(!xml.contains(r#"<collection short="rocky-linux-appstream-rpms">"#));
        assert!(!xml.contains("bash"));
    }

    #[test]
    fn cross_product_package_rows_are_never_served() {
        let mut foreign = package("evil-0:1.0-1.el9.x86_64.rpm", "evil", "BaseOS");
        foreign.supported_product_id = 9;
        let ctx = context(vec![
            foreign,
            package("evil-0:1.0-1.el9.src.rpm", "evil", "BaseOS"),
            package("bash-0:5.1.8-6.el9.x86_64.rpm", "bash", "BaseOS"),
            package("bash-0:5.1.8-6.el9.src.rpm", "bash", "BaseOS"),
        ]);
        let xml = assemble(std::slice::from_ref(&ctx), "BaseOS", &meta()).unwrap();

        assert!(!xml.contains("evil-1.0-1.el9.x86_64.rpm"));
        assert!(xml.contains("bash-5.1.8-6.el9.x86_64.rpm"));
    }

    #[test]
    fn updates_with_no_emittable_packages_are_dropped() {
        // Only a source package: the collection ends up empty.
        let ctx = context(vec![package("bash-0:5.1.8-6.el9.src.rpm", "bash", "BaseOS")]);
        let xml = assemble(std::slice::from_ref(&ctx), "BaseOS", &meta()).unwrap();
        assert!(!xml.contains("<update "));

        // Wrong repo likewise.
        let ctx = context(vec![
            package("bash-0:5.1.8-6.el9.x86_64.rpm", "bash", "AppStream"),
            package("bash-0:5.1.8-6.el9.src.rpm", "bash", "AppStream"),
        ]);
        let xml = assemble(std::slice::from_ref(&ctx), "BaseOS", &meta()).unwrap();
        assert!(!xml.contains("<update "));
    }

    #[test]
    fn emitted_arches_match_the_requested_slice() {
        let packages = vec![
            package("bash-0:5.1.8-6.el9.x86_64.rpm", "bash", "BaseOS"),
            package("bash-0:5.1.8-6.el9.aarch64.rpm", "bash", "BaseOS"),
            package("bash-0:5.1.8-6.el9.i686.rpm", "bash", "BaseOS"),
            package("bash-doc-0:5.1.8-6.el9.noarch.rpm", "bash", "BaseOS"),
            package("bash-0:5.1.8-6.el9.src.rpm", "bash", "BaseOS"),
        ];

        let xml = assemble(std::slice::from_ref(&context(packages.clone())), "BaseOS", &meta()).unwrap();
        assert!(xml.contains(r#"arch="x86_64""#));
        assert!(xml.contains(r#"arch="i686""#));
        assert!(xml.contains(r#"arch="noarch""#));
        assert!(!xml.contains(r#"arch="aarch64""#));

        let mut ctx = context(packages);
        ctx.arch = "aarch64".to_string();
        let xml = assemble(std::slice::from_ref(&ctx), "BaseOS", &meta()).unwrap();
        assert!(xml.contains(r#"arch="aarch64""#));
        assert!(xml.contains(r#"arch="noarch""#));
        assert!(!xml.contains(r#"arch="x86_64""#));
        assert!(!xml.contains(r#"arch="i686""#));
    }

    #[test]
    fn debug_packages_are_filtered() {
        let ctx = context(vec![
            package("bash-debuginfo-0:5.1.8-6.el9.x86_64.rpm", "bash", "BaseOS"),
            package("bash-debugsource-0:5.1.8-6.el9.x86_64.rpm", "bash", "BaseOS"),
            package("bash-0:5.1.8-6.el9.x86_64.rpm", "bash", "BaseOS"),
            package("bash-0:5.1.8-6.el9.src.rpm", "bash", "BaseOS"),
        ]);
        let xml = assemble(std::slice::from_ref(&ctx), "BaseOS", &meta()).unwrap();
        assert!(!xml.contains("debuginfo"));
        assert!(!xml.contains("debugsource"));
        assert!(xml.contains("bash-5.1.8-6.el9.x86_64.rpm"));
    }

    #[test]
    fn groups_without_a_source_rpm_are_dropped() {
        let ctx = context(vec![package(
            "orphan-0:1.0-1.el9.x86_64.rpm",
            "orphan",
            "BaseOS",
        )]);
        let xml = assemble(std::slice::from_ref(&ctx), "BaseOS", &meta()).unwrap();
        assert!(!xml.contains("orphan"));
    }

    /// Minimal mirror of the emitted document, for the parse-back law.
    mod parse_back {
        #[derive(Debug, serde::Deserialize)]
        pub struct Updates {
            #[serde(rename = "update", default)]
            pub updates: Vec<Update>,
        }

        #[derive(Debug, serde::Deserialize)]
        pub struct Update {
            pub id: String,
            pub pkglist: Pkglist,
        }

        #[derive(Debug, serde::Deserialize)]
        pub struct Pkglist {
            #[serde(rename = "collection", default)]
            pub collections: Vec<Collection>,
        }

        #[derive(Debug, serde::Deserialize)]
        pub struct Collection {
            #[serde(rename = "package", default)]
            pub packages: Vec<Package>,
        }

        #[derive(Debug, serde::Deserialize)]
        pub struct Package {
            #[serde(rename = "@name")]
            pub name: String,
            #[serde(rename = "@arch")]
            pub arch: String,
            #[serde(rename = "@version")]
            pub version: String,
            #[serde(rename = "@release")]
            pub release: String,
        }
    }

    #[test]
    fn emitted_document_parses_back_to_the_same_packages() {
        let ctx = context(vec![
            package("bash-0:5.1.8-6.el9.x86_64.rpm", "bash", "BaseOS"),
            package("bash-doc-0:5.1.8-6.el9.noarch.rpm", "bash", "BaseOS"),
            package("bash-0:5.1.8-6.el9.src.rpm", "bash", "BaseOS"),
        ]);
        let xml = assemble(std::slice::from_ref(&ctx), "BaseOS", &meta()).unwrap();

        let parsed: parse_back::Updates = quick_xml::de::from_str(&xml).unwrap();
        assert_eq!(parsed.updates.len(), 1);
        let update = &parsed.updates[0];
        assert_eq!(update.id, "RLSA-2024:1234");

        let mut names: Vec<(String, String)> = update
            .pkglist
            .collections
            .iter()
            .flat_map(|c| c.packages.iter())
            .map(|p| (p.name.clone(), p.arch.clone()))
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                ("bash".to_string(), "x86_64".to_string()),
                ("bash-doc".to_string(), "noarch".to_string()),
            ],
        );
    }
}
