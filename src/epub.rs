use std::fs::{self, OpenOptions};
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::Utc;
use zip::write::SimpleFileOptions;

const IMAGE_DIR: &str = "images";

/// In-memory EPUB3 book, serialized to a zip container by [`EpubBook::write`].
///
/// Sections are kept in insertion order; images are referenced by path and only read when the
/// book is written, so their files must outlive the book.
#[derive(Debug)]
pub struct EpubBook {
    title: String,
    lang: String,
    sections: Vec<Section>,
    images: Vec<ImageEntry>,
    cover: Option<String>,
}

#[derive(Debug)]
struct Section {
    stem: String,
    title: String,
    body_html: String,
}

#[derive(Debug)]
struct ImageEntry {
    name: String,
    abs_path: PathBuf,
    media_type: &'static str,
}

impl EpubBook {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            lang: "und".to_string(),
            sections: Vec::new(),
            images: Vec::new(),
            cover: None,
        }
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    /// Appends a section and returns its in-book href.
    pub fn add_section(&mut self, body_html: &str, title: &str) -> anyhow::Result<String> {
        if body_html.trim().is_empty() {
            anyhow::bail!("section body is empty: {title:?}");
        }
        let stem = format!("section{:04}", self.sections.len() + 1);
        let href = format!("{stem}.xhtml");
        self.sections.push(Section {
            stem,
            title: title.to_string(),
            body_html: body_html.to_string(),
        });
        Ok(href)
    }

    /// Registers the image stored at `path` under `name` and returns the href sections should
    /// use to reference it. A missing extension is filled in from the sniffed media type.
    pub fn add_image(&mut self, path: &Path, name: &str) -> anyhow::Result<String> {
        let media_type = sniff_image_media_type(path)
            .with_context(|| format!("inspect image: {}", path.display()))?;

        let mut name = name.trim().replace(['/', '\\'], "_");
        if name.is_empty() {
            anyhow::bail!("image name is empty: {}", path.display());
        }
        if Path::new(&name).extension().is_none() {
            name = format!("{name}.{}", extension_for_media_type(media_type));
        }

        let href = format!("{IMAGE_DIR}/{name}");
        if self.images.iter().any(|img| img.name == name) {
            return Ok(href);
        }
        self.images.push(ImageEntry {
            name,
            abs_path: path.to_path_buf(),
            media_type,
        });
        Ok(href)
    }

    /// Marks a previously added image as the book cover.
    pub fn set_cover(&mut self, image_href: &str) -> anyhow::Result<()> {
        let known = self
            .images
            .iter()
            .any(|img| format!("{IMAGE_DIR}/{}", img.name) == image_href);
        if !known {
            anyhow::bail!("cover image was not added to the book: {image_href}");
        }
        self.cover = Some(image_href.to_string());
        Ok(())
    }

    pub fn write(&self, out_path: &Path) -> anyhow::Result<()> {
        if self.sections.is_empty() {
            anyhow::bail!("epub has no sections: {}", out_path.display());
        }
        if let Some(parent) = out_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create epub parent dir: {}", parent.display()))?;
        }

        let uuid = uuid::Uuid::new_v4();
        let modified = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

        let out_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(out_path)
            .with_context(|| format!("open epub output: {}", out_path.display()))?;
        let mut zip = zip::ZipWriter::new(out_file);

        // `mimetype` must be the first entry and must be stored uncompressed.
        let mimetype_options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
            .unix_permissions(0o644);
        zip.start_file("mimetype", mimetype_options)
            .context("epub start_file mimetype")?;
        zip.write_all(b"application/epub+zip")
            .context("epub write mimetype")?;

        let deflated_options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(0o644);

        let fixed_entries = [
            ("META-INF/container.xml", render_container_xml()),
            (
                "OEBPS/content.opf",
                self.render_content_opf(uuid, &modified),
            ),
            ("OEBPS/nav.xhtml", self.render_nav_xhtml()),
            ("OEBPS/toc.ncx", self.render_toc_ncx(uuid)),
            ("OEBPS/style.css", default_style_css()),
        ];
        for (name, contents) in fixed_entries {
            zip.start_file(name, deflated_options)
                .with_context(|| format!("epub start_file {name}"))?;
            zip.write_all(contents.as_bytes())
                .with_context(|| format!("epub write {name}"))?;
        }

        if let Some(cover) = &self.cover {
            let body = format!(
                "<div class=\"cover\"><img src=\"{}\" alt=\"{}\" /></div>",
                xml_escape(cover),
                xml_escape(&self.title)
            );
            let xhtml = wrap_xhtml_document(&self.title, &self.lang, &body);
            zip.start_file("OEBPS/cover.xhtml", deflated_options)
                .context("epub start_file cover.xhtml")?;
            zip.write_all(xhtml.as_bytes())
                .context("epub write cover.xhtml")?;
        }

        for section in &self.sections {
            let html = ensure_xhtml_void_tags(&section.body_html);
            let html = replace_html_only_entities(&html);
            let xhtml = wrap_xhtml_document(&section.title, &self.lang, &html);

            zip.start_file(format!("OEBPS/{}.xhtml", section.stem), deflated_options)
                .with_context(|| format!("epub start_file section: {}", section.stem))?;
            zip.write_all(xhtml.as_bytes())
                .with_context(|| format!("epub write section: {}", section.stem))?;
        }

        for image in &self.images {
            let mut f = fs::File::open(&image.abs_path)
                .with_context(|| format!("open image: {}", image.abs_path.display()))?;
            zip.start_file(format!("OEBPS/{IMAGE_DIR}/{}", image.name), deflated_options)
                .with_context(|| format!("epub start_file image: {}", image.name))?;
            std::io::copy(&mut f, &mut zip)
                .with_context(|| format!("epub write image: {}", image.name))?;
        }

        zip.finish().context("epub finish zip")?;
        Ok(())
    }

    fn render_nav_xhtml(&self) -> String {
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
        out.push_str("<!DOCTYPE html>\n");
        out.push_str(&format!(
            "<html xmlns=\"http://www.w3.org/1999/xhtml\" xmlns:epub=\"http://www.idpf.org/2007/ops\" lang=\"{}\" xml:lang=\"{}\">\n",
            xml_escape(&self.lang),
            xml_escape(&self.lang)
        ));
        out.push_str("<head>\n");
        out.push_str(&format!("  <title>{}</title>\n", xml_escape(&self.title)));
        out.push_str("  <meta charset=\"utf-8\" />\n");
        out.push_str("</head>\n");
        out.push_str("<body>\n");
        out.push_str(&format!("  <h1>{}</h1>\n", xml_escape(&self.title)));
        out.push_str("  <nav epub:type=\"toc\" id=\"toc\">\n");
        out.push_str("    <ol>\n");
        for section in &self.sections {
            out.push_str(&format!(
                "      <li><a href=\"{}.xhtml\">{}</a></li>\n",
                xml_escape(&section.stem),
                xml_escape(&section.title)
            ));
        }
        out.push_str("    </ol>\n");
        out.push_str("  </nav>\n");
        out.push_str("</body>\n");
        out.push_str("</html>\n");
        out
    }

    fn render_toc_ncx(&self, uuid: uuid::Uuid) -> String {
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
        out.push_str("<ncx xmlns=\"http://www.daisy.org/z3986/2005/ncx/\" version=\"2005-1\">\n");
        out.push_str("  <head>\n");
        out.push_str(&format!(
            "    <meta name=\"dtb:uid\" content=\"urn:uuid:{uuid}\" />\n"
        ));
        out.push_str("    <meta name=\"dtb:depth\" content=\"1\" />\n");
        out.push_str("  </head>\n");
        out.push_str("  <docTitle><text>");
        out.push_str(&xml_escape(&self.title));
        out.push_str("</text></docTitle>\n");
        out.push_str("  <navMap>\n");
        for (idx, section) in self.sections.iter().enumerate() {
            let play = idx + 1;
            out.push_str(&format!(
                "    <navPoint id=\"navPoint-{play}\" playOrder=\"{play}\">\n"
            ));
            out.push_str("      <navLabel><text>");
            out.push_str(&xml_escape(&section.title));
            out.push_str("</text></navLabel>\n");
            out.push_str(&format!(
                "      <content src=\"{}.xhtml\" />\n",
                xml_escape(&section.stem)
            ));
            out.push_str("    </navPoint>\n");
        }
        out.push_str("  </navMap>\n");
        out.push_str("</ncx>\n");
        out
    }

    fn render_content_opf(&self, uuid: uuid::Uuid, modified: &str) -> String {
        let cover_id = self.cover.as_ref().and_then(|cover| {
            self.images
                .iter()
                .position(|img| format!("{IMAGE_DIR}/{}", img.name) == *cover)
                .map(image_item_id)
        });

        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
        out.push_str(&format!(
            "<package xmlns=\"http://www.idpf.org/2007/opf\" unique-identifier=\"bookid\" version=\"3.0\" xml:lang=\"{}\">\n",
            xml_escape(&self.lang)
        ));
        out.push_str("  <metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\">\n");
        out.push_str(&format!(
            "    <dc:identifier id=\"bookid\">urn:uuid:{uuid}</dc:identifier>\n"
        ));
        out.push_str(&format!(
            "    <dc:title>{}</dc:title>\n",
            xml_escape(&self.title)
        ));
        out.push_str(&format!(
            "    <dc:language>{}</dc:language>\n",
            xml_escape(&self.lang)
        ));
        out.push_str(&format!(
            "    <meta property=\"dcterms:modified\">{}</meta>\n",
            xml_escape(modified)
        ));
        if let Some(cover_id) = &cover_id {
            // EPUB2 readers (older Kindles included) only look at this.
            out.push_str(&format!(
                "    <meta name=\"cover\" content=\"{cover_id}\" />\n"
            ));
        }
        out.push_str("  </metadata>\n");
        out.push_str("  <manifest>\n");
        out.push_str(
            "    <item id=\"nav\" href=\"nav.xhtml\" media-type=\"application/xhtml+xml\" properties=\"nav\" />\n",
        );
        out.push_str(
            "    <item id=\"ncx\" href=\"toc.ncx\" media-type=\"application/x-dtbncx+xml\" />\n",
        );
        out.push_str("    <item id=\"css\" href=\"style.css\" media-type=\"text/css\" />\n");
        if cover_id.is_some() {
            out.push_str(
                "    <item id=\"cover-page\" href=\"cover.xhtml\" media-type=\"application/xhtml+xml\" />\n",
            );
        }

        for section in &self.sections {
            out.push_str(&format!(
                "    <item id=\"{}\" href=\"{}.xhtml\" media-type=\"application/xhtml+xml\" />\n",
                xml_escape(&section.stem),
                xml_escape(&section.stem)
            ));
        }

        for (idx, image) in self.images.iter().enumerate() {
            let id = image_item_id(idx);
            let properties = if cover_id.as_deref() == Some(id.as_str()) {
                " properties=\"cover-image\""
            } else {
                ""
            };
            out.push_str(&format!(
                "    <item id=\"{id}\" href=\"{IMAGE_DIR}/{}\" media-type=\"{}\"{properties} />\n",
                xml_escape(&image.name),
                image.media_type
            ));
        }

        out.push_str("  </manifest>\n");
        out.push_str("  <spine toc=\"ncx\">\n");
        if cover_id.is_some() {
            out.push_str("    <itemref idref=\"cover-page\" />\n");
        }
        for section in &self.sections {
            out.push_str(&format!(
                "    <itemref idref=\"{}\" />\n",
                xml_escape(&section.stem)
            ));
        }
        out.push_str("  </spine>\n");
        out.push_str("</package>\n");
        out
    }
}

fn image_item_id(idx: usize) -> String {
    format!("image-{}", idx + 1)
}

fn render_container_xml() -> String {
    r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>
"#
    .to_string()
}

fn default_style_css() -> String {
    r#"@charset "utf-8";

html { font-family: serif; }
body { margin: 0; padding: 0 1.2em; line-height: 1.6; }
img { max-width: 100%; height: auto; }
pre, code { font-family: ui-monospace, Menlo, Consolas, monospace; }
blockquote { margin: 1em 0; padding: 0 1em; border-left: 4px solid #ddd; }
.cover { text-align: center; }
"#
    .to_string()
}

fn wrap_xhtml_document(title: &str, lang: &str, body_html: &str) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<!DOCTYPE html>\n");
    out.push_str(&format!(
        "<html xmlns=\"http://www.w3.org/1999/xhtml\" lang=\"{}\" xml:lang=\"{}\">\n",
        xml_escape(lang),
        xml_escape(lang)
    ));
    out.push_str("<head>\n");
    out.push_str(&format!("  <title>{}</title>\n", xml_escape(title)));
    out.push_str("  <meta charset=\"utf-8\" />\n");
    out.push_str("  <link rel=\"stylesheet\" type=\"text/css\" href=\"style.css\" />\n");
    out.push_str("</head>\n");
    out.push_str("<body>\n");
    out.push_str(body_html);
    if !body_html.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("</body>\n");
    out.push_str("</html>\n");
    out
}

fn sniff_image_media_type(path: &Path) -> anyhow::Result<&'static str> {
    let mut head = Vec::with_capacity(512);
    fs::File::open(path)
        .with_context(|| format!("open image: {}", path.display()))?
        .take(512)
        .read_to_end(&mut head)
        .with_context(|| format!("read image header: {}", path.display()))?;

    if let Some(media_type) = media_type_for_bytes(&head) {
        return Ok(media_type);
    }
    match media_type_for_extension(path) {
        Some(media_type) => Ok(media_type),
        None => anyhow::bail!("unrecognized image format: {}", path.display()),
    }
}

fn media_type_for_bytes(head: &[u8]) -> Option<&'static str> {
    if head.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Some("image/png");
    }
    if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if head.starts_with(b"GIF87a") || head.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    if head.len() >= 12 && &head[..4] == b"RIFF" && &head[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    if head.len() >= 12 && &head[4..12] == b"ftypavif" {
        return Some("image/avif");
    }
    let text = String::from_utf8_lossy(head);
    let text = text.trim_start_matches('\u{feff}').trim_start();
    if text.starts_with("<svg") || (text.starts_with("<?xml") && text.contains("<svg")) {
        return Some("image/svg+xml");
    }
    None
}

fn media_type_for_extension(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "svg" => Some("image/svg+xml"),
        "webp" => Some("image/webp"),
        "avif" => Some("image/avif"),
        _ => None,
    }
}

fn extension_for_media_type(media_type: &str) -> &'static str {
    match media_type {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/svg+xml" => "svg",
        "image/webp" => "webp",
        "image/avif" => "avif",
        _ => "bin",
    }
}

/// HTML serializers emit `&nbsp;`, which is undefined in XHTML.
fn replace_html_only_entities(html: &str) -> String {
    html.replace("&nbsp;", "&#160;")
}

fn ensure_xhtml_void_tags(html: &str) -> String {
    // Convert void tags like `<img ...>` into `<img ... />` to keep EPUB XHTML well-formed.
    const VOID_TAGS: &[&str] = &[
        "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
        "source", "track", "wbr",
    ];

    let bytes = html.as_bytes();
    let mut out = String::with_capacity(html.len());
    let mut cursor = 0;

    while let Some(rel_lt) = html[cursor..].find('<') {
        let lt = cursor + rel_lt;
        out.push_str(&html[cursor..lt]);

        // Find the closing `>` while respecting quoted attribute values.
        let mut in_quote: Option<u8> = None;
        let mut gt = lt + 1;
        while gt < bytes.len() {
            let b = bytes[gt];
            if let Some(q) = in_quote {
                if b == q {
                    in_quote = None;
                }
                gt += 1;
                continue;
            }
            if b == b'"' || b == b'\'' {
                in_quote = Some(b);
                gt += 1;
                continue;
            }
            if b == b'>' {
                break;
            }
            gt += 1;
        }
        if gt >= bytes.len() {
            out.push_str(&html[lt..]);
            return out;
        }

        let raw_tag = &html[lt..=gt];
        if raw_tag
            .as_bytes()
            .get(1)
            .is_some_and(|b| matches!(b, b'!' | b'?' | b'/'))
        {
            out.push_str(raw_tag);
            cursor = gt + 1;
            continue;
        }

        let name_start = lt + 1;
        let mut name_end = name_start;
        while name_end < gt && (bytes[name_end] as char).is_ascii_alphabetic() {
            name_end += 1;
        }
        let tag_name = html[name_start..name_end].to_ascii_lowercase();
        if name_end == name_start || !VOID_TAGS.contains(&tag_name.as_str()) {
            out.push_str(raw_tag);
            cursor = gt + 1;
            continue;
        }

        let tag_without_gt = &html[lt..gt];
        if tag_without_gt.trim_end().ends_with('/') {
            out.push_str(raw_tag);
        } else {
            out.push_str(tag_without_gt);
            out.push_str(" />");
        }
        cursor = gt + 1;
    }

    out.push_str(&html[cursor..]);
    out
}

pub(crate) fn xml_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use std::io::Read as _;

    use super::*;

    const PIXEL_PNG: &[u8] = &[
        137, 80, 78, 71, 13, 10, 26, 10, 0, 0, 0, 13, 73, 72, 68, 82, 0, 0, 0, 1, 0, 0, 0, 1, 8, 4,
        0, 0, 0, 181, 28, 12, 2, 0, 0, 0, 11, 73, 68, 65, 84, 120, 218, 99, 252, 255, 23, 0, 2, 3,
        1, 128, 110, 220, 25, 0, 0, 0, 0, 73, 69, 78, 68, 174, 66, 96, 130,
    ];

    fn read_entry(archive: &mut zip::ZipArchive<fs::File>, name: &str) -> anyhow::Result<String> {
        let mut entry = archive.by_name(name)?;
        let mut out = String::new();
        entry.read_to_string(&mut out)?;
        Ok(out)
    }

    #[test]
    fn ensure_xhtml_void_tags_preserves_utf8_text() {
        let input = "<p>日本語のテスト</p><img src=\"x.png\"><br/>";
        let out = ensure_xhtml_void_tags(input);
        assert!(out.contains("日本語のテスト"));
        assert!(out.contains("<img src=\"x.png\" />"));
        assert!(out.contains("<br/>"));
    }

    #[test]
    fn add_image_appends_sniffed_extension() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("abc123");
        fs::write(&path, PIXEL_PNG)?;

        let mut book = EpubBook::new("Book");
        let href = book.add_image(&path, "abc123")?;
        assert_eq!(href, "images/abc123.png");
        assert_eq!(book.add_image(&path, "abc123")?, href);
        assert_eq!(book.images.len(), 1);
        Ok(())
    }

    #[test]
    fn add_image_rejects_non_images() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("error-page");
        fs::write(&path, b"<!doctype html><p>Bad Gateway</p>")?;

        let mut book = EpubBook::new("Book");
        let err = book.add_image(&path, "error-page").unwrap_err();
        assert!(format!("{err:#}").contains("unrecognized image format"));
        Ok(())
    }

    #[test]
    fn set_cover_requires_known_image() {
        let mut book = EpubBook::new("Book");
        assert!(book.set_cover("images/missing.png").is_err());
    }

    #[test]
    fn add_section_rejects_empty_body() {
        let mut book = EpubBook::new("Book");
        assert!(book.add_section("  ", "Empty").is_err());
        assert_eq!(book.section_count(), 0);
    }

    #[test]
    fn write_produces_ordered_spine_with_cover() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let image_path = temp.path().join("pixel");
        fs::write(&image_path, PIXEL_PNG)?;

        let mut book = EpubBook::new("Tom & Jerry");
        assert_eq!(
            book.add_section("<h1>One</h1><p>a&nbsp;b</p>", "One")?,
            "section0001.xhtml"
        );
        let img = book.add_image(&image_path, "pixel")?;
        book.add_section(&format!("<h1>Two</h1><img src=\"{img}\">"), "Two")?;
        let cover = book.add_image(&image_path, "cover")?;
        book.set_cover(&cover)?;

        let out_path = temp.path().join("out").join("book.epub");
        book.write(&out_path)?;

        let mut archive = zip::ZipArchive::new(fs::File::open(&out_path)?)?;
        {
            let first = archive.by_index(0)?;
            assert_eq!(first.name(), "mimetype");
            assert_eq!(first.compression(), zip::CompressionMethod::Stored);
        }

        let opf = read_entry(&mut archive, "OEBPS/content.opf")?;
        assert!(opf.contains("<dc:title>Tom &amp; Jerry</dc:title>"));
        assert!(opf.contains("<meta name=\"cover\" content=\"image-2\" />"));
        assert!(opf.contains("properties=\"cover-image\""));
        let cover_pos = opf.find("idref=\"cover-page\"").unwrap();
        let one_pos = opf.find("idref=\"section0001\"").unwrap();
        let two_pos = opf.find("idref=\"section0002\"").unwrap();
        assert!(cover_pos < one_pos && one_pos < two_pos);

        let one = read_entry(&mut archive, "OEBPS/section0001.xhtml")?;
        assert!(one.contains("a&#160;b"));
        let two = read_entry(&mut archive, "OEBPS/section0002.xhtml")?;
        assert!(two.contains("<img src=\"images/pixel.png\" />"));
        assert!(archive.by_name("OEBPS/images/pixel.png").is_ok());
        assert!(archive.by_name("OEBPS/cover.xhtml").is_ok());
        Ok(())
    }
}
