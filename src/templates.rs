use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Template whose sandboxes run code cells and expose no URL.
pub const CODE_INTERPRETER: &str = "code-interpreter-v1";

/// Sandbox template a fragment can target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    #[serde(default)]
    pub lib: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default)]
    pub instructions: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Template id -> template. Ordered so prompts are stable.
pub type Templates = BTreeMap<String, Template>;

fn template(name: &str, lib: &[&str], file: &str, instructions: &str, port: Option<u16>) -> Template {
    Template {
        name: name.to_string(),
        lib: lib.iter().map(|l| l.to_string()).collect(),
        file: Some(file.to_string()),
        instructions: instructions.to_string(),
        port,
    }
}

pub fn builtin() -> Templates {
    let mut t = Templates::new();
    t.insert(
        CODE_INTERPRETER.to_string(),
        template(
            "Python data analyst",
            &["python", "jupyter", "numpy", "pandas", "matplotlib", "seaborn", "plotly"],
            "script.py",
            "Runs code as a Jupyter notebook cell. Strong data analysis angle. Can use complex visualisation to explain results.",
            None,
        ),
    );
    t.insert(
        "nextjs-developer".to_string(),
        template(
            "Next.js developer",
            &["nextjs@14.2.5", "typescript", "@types/node", "@types/react", "@types/react-dom", "postcss", "tailwindcss", "shadcn"],
            "pages/index.tsx",
            "A Next.js 13+ app that reloads automatically. Using the pages router.",
            Some(3000),
        ),
    );
    t.insert(
        "vue-developer".to_string(),
        template(
            "Vue.js developer",
            &["vue@latest", "nuxt@3.13.0", "tailwindcss"],
            "app.vue",
            "A Vue.js 3+ app that reloads automatically. Only when asked specifically for a Vue app.",
            Some(3000),
        ),
    );
    t.insert(
        "streamlit-developer".to_string(),
        template(
            "Streamlit developer",
            &["streamlit", "pandas", "numpy", "matplotlib", "requests", "seaborn", "plotly"],
            "app.py",
            "A streamlit app that reloads automatically.",
            Some(8501),
        ),
    );
    t.insert(
        "gradio-developer".to_string(),
        template(
            "Gradio developer",
            &["gradio", "pandas", "numpy", "matplotlib", "requests", "seaborn", "plotly"],
            "app.py",
            "A gradio app. Gradio Blocks/Interface should be called demo.",
            Some(7860),
        ),
    );
    t
}

/// Resolve a template selection: "auto" (or nothing) means every template,
/// an unknown id falls back to every template as well.
pub fn select(all: &Templates, selected: Option<&str>) -> Templates {
    match selected {
        Some(id) if id != "auto" => match all.get(id) {
            Some(t) => Templates::from([(id.to_string(), t.clone())]),
            None => all.clone(),
        },
        _ => all.clone(),
    }
}

/// Numbered description of each template for the system prompt.
pub fn templates_to_prompt(templates: &Templates) -> String {
    templates
        .iter()
        .enumerate()
        .map(|(idx, (id, t))| {
            let file = t
                .file
                .as_deref()
                .map(|f| format!("File: {f}"))
                .unwrap_or_else(|| "File: none".to_string());
            let port = t
                .port
                .map(|p| format!("port: {p}"))
                .unwrap_or_else(|| "no port".to_string());
            format!(
                "{}. {id}: \"{}\". {file}. Dependencies installed: {}. {port}.",
                idx + 1,
                t.instructions,
                t.lib.join(", ")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
