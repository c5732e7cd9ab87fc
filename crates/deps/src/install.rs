//! Unpacking wheels into the project virtual environment layer.

use crate::error::InstallError;
use crate::python::PythonVersion;
use crate::requirement::normalize_name;
use pinbox_image::layer::{EXEC_MODE, FILE_MODE};
use pinbox_image::{LayerBuilder, LayerError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use tracing::debug;

pub const INSTALLER_NAME: &str = "pinbox";
pub const INSTALL_RECORD_FILE: &str = "pinbox-installed.json";
pub const DEFAULT_VENV: &str = "/app/.venv";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VenvLayout {
    root: String,
    python: PythonVersion,
}

impl VenvLayout {
    pub fn new(root: &str, python: PythonVersion) -> Self {
        Self {
            root: format!("/{}", root.trim_matches('/')),
            python,
        }
    }

    /// `<workdir>/.venv`
    pub fn in_workdir(workdir: &str, python: PythonVersion) -> Self {
        Self::new(&format!("{}/.venv", workdir.trim_end_matches('/')), python)
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn python(&self) -> PythonVersion {
        self.python
    }

    pub fn bin_dir(&self) -> String {
        format!("{}/bin", self.root)
    }

    pub fn python_bin(&self) -> String {
        format!("{}/bin/python", self.root)
    }

    pub fn site_packages(&self) -> String {
        format!("{}/lib/python{}/site-packages", self.root, self.python)
    }

    pub fn record_path(&self) -> String {
        format!("{}/{}", self.root, INSTALL_RECORD_FILE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
    pub files: usize,
}

/// `pinbox-installed.json`: exactly the installed `name==version` pins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRecord {
    pub installer: String,
    pub python: String,
    pub packages: Vec<String>,
}

struct WheelEntry {
    data: Vec<u8>,
    mode: u32,
}

#[derive(Debug, Clone)]
pub struct WheelInstaller {
    layout: VenvLayout,
}

impl WheelInstaller {
    pub fn new(layout: VenvLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &VenvLayout {
        &self.layout
    }

    /// Interpreter links and `pyvenv.cfg`.
    pub fn create_venv(&self, builder: &mut LayerBuilder) -> Result<(), LayerError> {
        let interpreter = self.layout.python.interpreter_path();
        let home = interpreter
            .rsplit_once('/')
            .map(|(dir, _)| dir.to_string())
            .unwrap_or_default();
        let cfg = format!(
            "home = {}\ninclude-system-site-packages = false\nversion = {}\nexecutable = {}\n",
            home, self.layout.python, interpreter
        );

        builder.add_file(
            &format!("{}/pyvenv.cfg", self.layout.root),
            cfg.into_bytes(),
            FILE_MODE,
        )?;
        builder.add_symlink(&self.layout.python_bin(), &interpreter)?;
        builder.add_symlink(
            &format!("{}/python{}", self.layout.bin_dir(), self.layout.python.major),
            "python",
        )?;
        builder.add_symlink(
            &format!("{}/python{}", self.layout.bin_dir(), self.layout.python),
            "python",
        )?;
        builder.add_dir(&self.layout.site_packages(), pinbox_image::layer::DIR_MODE)?;
        Ok(())
    }

    /// Unpack one wheel. The wheel's `.dist-info` must name `package`.
    pub fn install(
        &self,
        builder: &mut LayerBuilder,
        package: &str,
        version: &str,
        wheel: &[u8],
    ) -> Result<InstalledPackage, InstallError> {
        let invalid = |reason: String| InstallError::InvalidWheel {
            package: package.to_string(),
            reason,
        };
        let layer_err = |source: LayerError| InstallError::Layer {
            package: package.to_string(),
            source,
        };

        let entries = read_wheel(package, wheel)?;

        let dist_info = entries
            .keys()
            .filter_map(|path| path.strip_suffix("/WHEEL"))
            .find(|dir| dir.ends_with(".dist-info") && !dir.contains('/'))
            .map(String::from)
            .ok_or_else(|| invalid("missing .dist-info/WHEEL".to_string()))?;
        let dist_name = dist_info
            .trim_end_matches(".dist-info")
            .split('-')
            .next()
            .map(normalize_name)
            .unwrap_or_default();
        if dist_name != normalize_name(package) {
            return Err(invalid(format!(
                "contains {} instead of {}",
                dist_info, package
            )));
        }
        let data_dir = format!("{}.data/", dist_info.trim_end_matches(".dist-info"));

        let site_packages = self.layout.site_packages();
        let bin_dir = self.layout.bin_dir();
        let mut files = 0;

        for (path, entry) in &entries {
            let (target, mode, data) = match path.strip_prefix(&data_dir) {
                Some(rest) => {
                    let (scheme, rel) = rest.split_once('/').unwrap_or((rest, ""));
                    if rel.is_empty() {
                        continue;
                    }
                    match scheme {
                        "scripts" => (
                            format!("{}/{}", bin_dir, rel),
                            EXEC_MODE,
                            self.rewrite_shebang(&entry.data),
                        ),
                        "purelib" | "platlib" => (
                            format!("{}/{}", site_packages, rel),
                            entry.mode,
                            entry.data.clone(),
                        ),
                        "data" => (
                            format!("{}/{}", self.layout.root, rel),
                            entry.mode,
                            entry.data.clone(),
                        ),
                        other => {
                            debug!("Skipping {} entry {} in {}", other, rel, package);
                            continue;
                        }
                    }
                }
                None => (
                    format!("{}/{}", site_packages, path),
                    entry.mode,
                    entry.data.clone(),
                ),
            };
            builder.add_file(&target, data, mode).map_err(layer_err)?;
            files += 1;
        }

        builder
            .add_file(
                &format!("{}/{}/INSTALLER", site_packages, dist_info),
                format!("{}\n", INSTALLER_NAME).into_bytes(),
                FILE_MODE,
            )
            .map_err(layer_err)?;

        if let Some(entry_points) = entries.get(&format!("{}/entry_points.txt", dist_info)) {
            let text = String::from_utf8_lossy(&entry_points.data);
            for (name, module, attr) in console_scripts(&text) {
                let path = format!("{}/{}", bin_dir, name);
                if builder.contains(&path) {
                    continue;
                }
                let script = format!(
                    "#!{}\nimport sys\nfrom {} import {}\nif __name__ == \"__main__\":\n    sys.exit({}())\n",
                    self.layout.python_bin(),
                    module,
                    attr.split('.').next().unwrap_or(&attr),
                    attr
                );
                builder
                    .add_file(&path, script.into_bytes(), EXEC_MODE)
                    .map_err(layer_err)?;
            }
        }

        debug!("Installed {}=={} ({} files)", package, version, files);
        Ok(InstalledPackage {
            name: normalize_name(package),
            version: version.to_string(),
            files,
        })
    }

    pub fn write_record(
        &self,
        builder: &mut LayerBuilder,
        installed: &[InstalledPackage],
    ) -> Result<InstallRecord, LayerError> {
        let mut packages: Vec<String> = installed
            .iter()
            .map(|p| format!("{}=={}", p.name, p.version))
            .collect();
        packages.sort();

        let record = InstallRecord {
            installer: INSTALLER_NAME.to_string(),
            python: self.layout.python.to_string(),
            packages,
        };
        let mut json = serde_json::to_vec_pretty(&record).map_err(std::io::Error::from)?;
        json.push(b'\n');
        builder.add_file(&self.layout.record_path(), json, FILE_MODE)?;
        Ok(record)
    }

    fn rewrite_shebang(&self, data: &[u8]) -> Vec<u8> {
        for prefix in [&b"#!pythonw"[..], &b"#!python"[..]] {
            if let Some(rest) = data.strip_prefix(prefix) {
                let line_end = rest.iter().position(|b| *b == b'\n').unwrap_or(rest.len());
                let mut out = format!("#!{}", self.layout.python_bin()).into_bytes();
                out.extend_from_slice(&rest[line_end..]);
                return out;
            }
        }
        data.to_vec()
    }
}

fn read_wheel(package: &str, wheel: &[u8]) -> Result<BTreeMap<String, WheelEntry>, InstallError> {
    let invalid = |reason: String| InstallError::InvalidWheel {
        package: package.to_string(),
        reason,
    };

    let mut archive = zip::ZipArchive::new(Cursor::new(wheel)).map_err(|e| invalid(e.to_string()))?;
    let mut entries = BTreeMap::new();

    for index in 0..archive.len() {
        let mut file = archive.by_index(index).map_err(|e| invalid(e.to_string()))?;
        if file.is_dir() {
            continue;
        }
        let raw_name = file.name().to_string();
        let path = file
            .enclosed_name()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .filter(|p| !p.is_empty())
            .ok_or_else(|| InstallError::UnsafePath {
                package: package.to_string(),
                path: raw_name.clone(),
            })?;
        let mode = match file.unix_mode() {
            Some(mode) if mode & 0o111 != 0 => EXEC_MODE,
            _ => FILE_MODE,
        };
        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data)
            .map_err(|e| invalid(format!("{}: {}", raw_name, e)))?;
        entries.insert(path, WheelEntry { data, mode });
    }

    Ok(entries)
}

/// `(name, module, attribute)` triples from the `[console_scripts]` section.
fn console_scripts(entry_points: &str) -> Vec<(String, String, String)> {
    let mut in_section = false;
    let mut scripts = Vec::new();
    for line in entry_points.lines().map(str::trim) {
        if line.starts_with('[') {
            in_section = line == "[console_scripts]";
            continue;
        }
        if !in_section || line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name, target)) = line.split_once('=') else {
            continue;
        };
        let target = target.split('[').next().unwrap_or(target).trim();
        if let Some((module, attr)) = target.split_once(':') {
            scripts.push((
                name.trim().to_string(),
                module.trim().to_string(),
                attr.trim().to_string(),
            ));
        }
    }
    scripts
}


#[cfg(test)]
mod tests {
    use super::testing::build_wheel;
    use super::*;
    use pinbox_image::LayerEntry;

    fn installer() -> WheelInstaller {
        WheelInstaller::new(VenvLayout::in_workdir("/app", PythonVersion::new(3, 12)))
    }

    fn file_content(layer: &pinbox_image::Layer, path: &str) -> String {
        match layer.get(path) {
            Some(LayerEntry::File { data, .. }) => String::from_utf8_lossy(data).to_string(),
            other => panic!("{} is not a file: {:?}", path, other),
        }
    }

    #[test]
    fn test_layout_paths() {
        let layout = VenvLayout::in_workdir("/app/", PythonVersion::new(3, 12));
        assert_eq!(layout.root(), "/app/.venv");
        assert_eq!(layout.bin_dir(), "/app/.venv/bin");
        assert_eq!(layout.site_packages(), "/app/.venv/lib/python3.12/site-packages");
        assert_eq!(layout.record_path(), "/app/.venv/pinbox-installed.json");
    }

    #[test]
    fn test_create_venv() {
        let mut builder = LayerBuilder::new();
        installer().create_venv(&mut builder).unwrap();
        let layer = builder.finish().unwrap();

        assert!(file_content(&layer, "app/.venv/pyvenv.cfg").contains("version = 3.12"));
        assert_eq!(
            layer.get("app/.venv/bin/python"),
            Some(&LayerEntry::Symlink {
                target: "/usr/local/bin/python3.12".to_string()
            })
        );
        assert!(matches!(
            layer.get("app/.venv/lib/python3.12/site-packages"),
            Some(LayerEntry::Dir { .. })
        ));
    }

    #[test]
    fn test_install_wheel() {
        let wheel = build_wheel(
            "a",
            "1.0",
            &[
                ("a/__init__.py", b"VERSION = '1.0'\n", 0o644),
                ("a-1.0.data/scripts/a-tool", b"#!python\nprint('tool')\n", 0o644),
                ("a-1.0.data/purelib/a_extra.py", b"", 0o644),
                (
                    "a-1.0.dist-info/entry_points.txt",
                    b"[console_scripts]\na-cli = a.cli:main\n\n[other]\nx = y:z\n",
                    0o644,
                ),
            ],
        );

        let mut builder = LayerBuilder::new();
        let installed = installer().install(&mut builder, "A", "1.0", &wheel).unwrap();
        assert_eq!(installed.name, "a");
        assert_eq!(installed.files, 6);
        let layer = builder.finish().unwrap();

        let site = "app/.venv/lib/python3.12/site-packages";
        assert_eq!(
            file_content(&layer, &format!("{}/a/__init__.py", site)),
            "VERSION = '1.0'\n"
        );
        assert!(layer.get(&format!("{}/a_extra.py", site)).is_some());
        assert_eq!(
            file_content(&layer, &format!("{}/a-1.0.dist-info/INSTALLER", site)),
            "pinbox\n"
        );

        let tool = layer.get("app/.venv/bin/a-tool").unwrap();
        assert!(tool.is_executable());
        assert_eq!(
            file_content(&layer, "app/.venv/bin/a-tool"),
            "#!/app/.venv/bin/python\nprint('tool')\n"
        );

        let cli = file_content(&layer, "app/.venv/bin/a-cli");
        assert!(cli.starts_with("#!/app/.venv/bin/python\n"));
        assert!(cli.contains("from a.cli import main"));
        assert!(layer.get("app/.venv/bin/x").is_none());
    }

    #[test]
    fn test_install_is_deterministic() {
        let wheel = build_wheel("a", "1.0", &[("a/__init__.py", b"", 0o644)]);
        let build = || {
            let mut builder = LayerBuilder::new();
            installer().install(&mut builder, "a", "1.0", &wheel).unwrap();
            builder.finish().unwrap()
        };
        assert_eq!(build().diff_id(), build().diff_id());
    }

    #[test]
    fn test_wheel_for_other_package_rejected() {
        let wheel = build_wheel("b", "1.0", &[("b/__init__.py", b"", 0o644)]);
        let mut builder = LayerBuilder::new();
        let err = installer()
            .install(&mut builder, "a", "1.0", &wheel)
            .unwrap_err();
        assert!(matches!(err, InstallError::InvalidWheel { .. }));
    }

    #[test]
    fn test_not_a_zip_rejected() {
        let mut builder = LayerBuilder::new();
        let err = installer()
            .install(&mut builder, "a", "1.0", b"not a zip")
            .unwrap_err();
        assert!(matches!(err, InstallError::InvalidWheel { .. }));
    }

    #[test]
    fn test_write_record_is_sorted() {
        let mut builder = LayerBuilder::new();
        let record = installer()
            .write_record(
                &mut builder,
                &[
                    InstalledPackage {
                        name: "b".to_string(),
                        version: "2.1.0".to_string(),
                        files: 1,
                    },
                    InstalledPackage {
                        name: "a".to_string(),
                        version: "1.0".to_string(),
                        files: 1,
                    },
                ],
            )
            .unwrap();
        assert_eq!(record.packages, vec!["a==1.0", "b==2.1.0"]);

        let layer = builder.finish().unwrap();
        let parsed: InstallRecord =
            serde_json::from_str(&file_content(&layer, "app/.venv/pinbox-installed.json"))
                .unwrap();
        assert_eq!(parsed, record);
    }
}
