//! Load options and the optional `vellum.toml` defaults file.
//!
//! Programmatic [`LoadOptions`] always win; the defaults file only fills
//! gaps. Parsing is tolerant: unknown fields are ignored and a broken file
//! falls back to built-in defaults so a bad config never blocks a load.

use std::path::PathBuf;

use core_dom::{ElementId, HostSurface};
use core_provider::DocumentSource;
use core_virt::{VirtualizerConfig, ZoomPolicy};
use serde::Deserialize;
use tracing::{info, warn};

/// Fine-grained toolbar feature toggles.
#[derive(Debug, Clone, Copy)]
pub struct ToolbarOptions {
    pub show_zoom_controls: bool,
    pub show_page_navigation: bool,
    pub show_rotation: bool,
    pub show_download: bool,
}

impl Default for ToolbarOptions {
    fn default() -> Self {
        Self {
            show_zoom_controls: true,
            show_page_navigation: true,
            show_rotation: true,
            show_download: true,
        }
    }
}

/// Replaceable toolbar implementation. The core only ever calls these two
/// methods.
pub trait Toolbar: Send + Sync {
    fn render(&self, surface: &HostSurface, host: ElementId) -> anyhow::Result<()>;
    fn destroy(&self);
}

/// Everything a caller can configure on `load`.
pub struct LoadOptions {
    /// Host element id; must be unique across live viewers.
    pub container_id: String,
    pub source: DocumentSource,
    pub password: Option<String>,
    pub disable_toolbar: bool,
    pub disable_text_selection: bool,
    /// Mini-viewer mode: render exactly this page.
    pub render_specific_page_only: Option<u32>,
    pub toolbar_options: ToolbarOptions,
    pub custom_toolbar: Option<Box<dyn Toolbar>>,
    pub initial_scale: Option<f32>,
    pub min_scale: Option<f32>,
    pub max_scale: Option<f32>,
    pub zoom_step: Option<f32>,
    /// Window radius around the current page.
    pub page_buffer: Option<u32>,
    /// Override for the Document Provider worker location.
    pub worker_src: Option<String>,
}

impl LoadOptions {
    pub fn new(container_id: impl Into<String>, source: DocumentSource) -> Self {
        Self {
            container_id: container_id.into(),
            source,
            password: None,
            disable_toolbar: false,
            disable_text_selection: false,
            render_specific_page_only: None,
            toolbar_options: ToolbarOptions::default(),
            custom_toolbar: None,
            initial_scale: None,
            min_scale: None,
            max_scale: None,
            zoom_step: None,
            page_buffer: None,
            worker_src: None,
        }
    }
}

impl std::fmt::Debug for LoadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadOptions")
            .field("container_id", &self.container_id)
            .field("source", &self.source)
            .field("disable_toolbar", &self.disable_toolbar)
            .field("disable_text_selection", &self.disable_text_selection)
            .field("render_specific_page_only", &self.render_specific_page_only)
            .field("custom_toolbar", &self.custom_toolbar.is_some())
            .field("page_buffer", &self.page_buffer)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize, Default, Clone, Copy)]
pub struct ViewerSection {
    #[serde(default)]
    pub page_buffer: Option<u32>,
    #[serde(default)]
    pub zoom_step: Option<f32>,
    #[serde(default)]
    pub min_scale: Option<f32>,
    #[serde(default)]
    pub max_scale: Option<f32>,
    #[serde(default)]
    pub page_gap: Option<f32>,
}

/// Parsed `vellum.toml`.
#[derive(Debug, Deserialize, Default, Clone, Copy)]
pub struct ViewerFileConfig {
    #[serde(default)]
    pub viewer: ViewerSection,
}

/// Prefer a working-directory `vellum.toml`.
pub fn discover_defaults() -> PathBuf {
    PathBuf::from("vellum.toml")
}

pub fn load_defaults_from(path: Option<PathBuf>) -> ViewerFileConfig {
    let path = path.unwrap_or_else(discover_defaults);
    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str::<ViewerFileConfig>(&content) {
            Ok(config) => {
                info!(target: "instance.config", path = %path.display(), "defaults_loaded");
                config
            }
            Err(error) => {
                warn!(target: "instance.config", path = %path.display(), %error, "defaults_unparsable");
                ViewerFileConfig::default()
            }
        },
        Err(_) => ViewerFileConfig::default(),
    }
}

/// Merge load options over file defaults into a virtualizer configuration,
/// clamping nonsense values instead of failing.
pub fn resolve_virtualizer_config(
    options: &LoadOptions,
    defaults: &ViewerFileConfig,
) -> VirtualizerConfig {
    let base = VirtualizerConfig::default();
    let file = &defaults.viewer;

    let min_scale = options
        .min_scale
        .or(file.min_scale)
        .unwrap_or(base.zoom.min_scale)
        .max(0.01);
    let max_scale = options
        .max_scale
        .or(file.max_scale)
        .unwrap_or(base.zoom.max_scale)
        .max(min_scale);
    let step = options
        .zoom_step
        .or(file.zoom_step)
        .unwrap_or(base.zoom.step)
        .max(0.01);
    let zoom = ZoomPolicy {
        min_scale,
        max_scale,
        step,
    };

    VirtualizerConfig {
        buffer: options
            .page_buffer
            .or(file.page_buffer)
            .unwrap_or(base.buffer)
            .max(1),
        gap: file.page_gap.unwrap_or(base.gap).max(0.0),
        initial_scale: options.initial_scale.unwrap_or(base.initial_scale),
        disable_text_overlay: options.disable_text_selection,
        single_page: options.render_specific_page_only,
        zoom,
        ..base
    }
}

/// Built-in toolbar: a row of controls gated by [`ToolbarOptions`].
#[derive(Debug, Default)]
pub struct DefaultToolbar {
    pub options: ToolbarOptions,
}

impl Toolbar for DefaultToolbar {
    fn render(&self, surface: &HostSurface, host: ElementId) -> anyhow::Result<()> {
        let bar = surface.create_element("div");
        surface.set_attribute(bar, "class", "viewerToolbar")?;
        let mut controls: Vec<&str> = Vec::new();
        if self.options.show_page_navigation {
            controls.extend(["prev", "next", "pager"]);
        }
        if self.options.show_zoom_controls {
            controls.extend(["zoom-out", "zoom-in", "fit-width"]);
        }
        if self.options.show_rotation {
            controls.push("rotate");
        }
        if self.options.show_download {
            controls.push("download");
        }
        for control in controls {
            let button = surface.create_element("button");
            surface.set_attribute(button, "data-action", control)?;
            surface.append_child(bar, button)?;
        }
        surface.append_child(host, bar)?;
        Ok(())
    }

    fn destroy(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn options() -> LoadOptions {
        LoadOptions::new("host", DocumentSource::Bytes(Arc::new(vec![1])))
    }

    #[test]
    fn missing_defaults_file_yields_builtin_config() {
        let defaults = load_defaults_from(Some(PathBuf::from("__no_such_vellum__.toml")));
        let config = resolve_virtualizer_config(&options(), &defaults);
        assert_eq!(config.buffer, 3);
        assert_eq!(config.zoom.step, 0.25);
        assert_eq!(config.gap, 15.0);
    }

    #[test]
    fn file_defaults_fill_gaps_but_options_win() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            tmp.path(),
            "[viewer]\npage_buffer = 5\nzoom_step = 0.5\nmax_scale = 4.0\n",
        )
        .unwrap();
        let defaults = load_defaults_from(Some(tmp.path().to_path_buf()));

        let mut opts = options();
        opts.page_buffer = Some(2);
        let config = resolve_virtualizer_config(&opts, &defaults);
        assert_eq!(config.buffer, 2, "explicit option beats the file");
        assert_eq!(config.zoom.step, 0.5, "file fills the unset step");
        assert_eq!(config.zoom.max_scale, 4.0);
    }

    #[test]
    fn broken_defaults_file_is_ignored() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "[viewer\nnot toml at all").unwrap();
        let defaults = load_defaults_from(Some(tmp.path().to_path_buf()));
        let config = resolve_virtualizer_config(&options(), &defaults);
        assert_eq!(config.buffer, 3);
    }

    #[test]
    fn degenerate_scale_bounds_are_clamped() {
        let mut opts = options();
        opts.min_scale = Some(2.0);
        opts.max_scale = Some(0.5);
        opts.zoom_step = Some(-1.0);
        let config = resolve_virtualizer_config(&opts, &ViewerFileConfig::default());
        assert!(config.zoom.max_scale >= config.zoom.min_scale);
        assert!(config.zoom.step > 0.0);
    }

    #[test]
    fn single_page_and_text_selection_flow_through() {
        let mut opts = options();
        opts.render_specific_page_only = Some(9);
        opts.disable_text_selection = true;
        let config = resolve_virtualizer_config(&opts, &ViewerFileConfig::default());
        assert_eq!(config.single_page, Some(9));
        assert!(config.disable_text_overlay);
    }

    #[test]
    fn default_toolbar_renders_gated_controls() {
        let surface = HostSurface::new();
        let host = surface.register_container("bar-host");
        let toolbar = DefaultToolbar {
            options: ToolbarOptions {
                show_download: false,
                show_rotation: false,
                ..Default::default()
            },
        };
        toolbar.render(&surface, host).unwrap();
        let bar = surface.children(host)[0];
        let actions: Vec<String> = surface
            .children(bar)
            .iter()
            .filter_map(|b| surface.attribute(*b, "data-action"))
            .collect();
        assert_eq!(
            actions,
            vec!["prev", "next", "pager", "zoom-out", "zoom-in", "fit-width"]
        );
    }
}
