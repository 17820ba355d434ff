//! Generated bundler entry points.

use std::path::Path;

/// Name of the function the server bundle installs on `globalThis`.
pub const RENDER_ENTRY: &str = "__kilnRender";

/// Element id suffix of the script tag carrying a mount point's props.
pub const PROPS_SUFFIX: &str = "-props";

fn js_string(value: &str) -> String {
    // a JSON string literal is a valid JS string literal
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

/// Server entry: imports the component and installs the render function.
/// Bundled as an IIFE, so evaluating it has exactly that side effect.
pub fn server_entry(component: &Path) -> String {
    format!(
        r#"import {{ createElement }} from "react";
import {{ renderToString }} from "react-dom/server";
import Component from {component};

globalThis.{entry} = function (propsJson) {{
  const props = propsJson ? JSON.parse(propsJson) : {{}};
  return renderToString(createElement(Component, props));
}};
"#,
        component = js_string(&component.to_string_lossy()),
        entry = RENDER_ENTRY,
    )
}

/// Client entry: hydrates `#<mount_point>` with the props serialized into
/// the `<mount_point>-props` script tag.
pub fn client_entry(component: &Path, mount_point: &str) -> String {
    format!(
        r#"import {{ createElement }} from "react";
import {{ hydrateRoot }} from "react-dom/client";
import Component from {component};

const root = document.getElementById({mount});
const propsTag = document.getElementById({props_id});
const props = propsTag && propsTag.textContent ? JSON.parse(propsTag.textContent) : {{}};

if (root) {{
  hydrateRoot(root, createElement(Component, props));
}}
"#,
        component = js_string(&component.to_string_lossy()),
        mount = js_string(mount_point),
        props_id = js_string(&format!("{}{}", mount_point, PROPS_SUFFIX)),
    )
}

/// Invokes the render function installed by a server bundle.
pub fn render_invocation(props_json: &str) -> String {
    format!(
        r#"(function (payload) {{
  if (typeof globalThis.{entry} !== "function") {{
    throw new Error("server bundle did not define {entry}");
  }}
  return globalThis.{entry}(payload);
}})({payload})"#,
        entry = RENDER_ENTRY,
        payload = js_string(props_json),
    )
}
