use proc_macro::TokenStream;

use quote::{format_ident, quote};
use syn::parse_quote;
use syn::{
    Attribute, Expr, ExprArray, ExprLit, ExprPath, ItemStruct, Lit, Meta, Token, parse::Parser,
    spanned::Spanned,
};

/// Declares a pipeline task. The annotated struct is the task's step config
/// (deserialized from `[<module>.steps.<step>]` unless `config_path` says
/// otherwise) and must provide `enabled`, `label` and a
/// `fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()>`.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Task(attr: TokenStream, item: TokenStream) -> TokenStream {
    match task_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

/// Declares a pipeline module: the stage it belongs to, the config table
/// whose presence enables it, and the tasks it plans.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Module(attr: TokenStream, item: TokenStream) -> TokenStream {
    match module_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

fn lit_str(expr: &Expr) -> syn::Result<String> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => Ok(s.value()),
        _ => Err(syn::Error::new(expr.span(), "expected string literal")),
    }
}

fn lit_bool(expr: &Expr) -> syn::Result<bool> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Bool(b), ..
        }) => Ok(b.value),
        _ => Err(syn::Error::new(expr.span(), "expected bool literal")),
    }
}

fn array_elems(expr: &Expr) -> syn::Result<Vec<&Expr>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    Ok(elems.iter().collect())
}

fn array_strings(expr: &Expr) -> syn::Result<Vec<String>> {
    array_elems(expr)?.into_iter().map(lit_str).collect()
}

fn array_paths(expr: &Expr) -> syn::Result<Vec<syn::Path>> {
    array_elems(expr)?
        .into_iter()
        .map(|e| match e {
            Expr::Path(ExprPath { path, .. }) => Ok(path.clone()),
            _ => Err(syn::Error::new(e.span(), "expected task type path")),
        })
        .collect()
}

fn config_type(expr: &Expr) -> syn::Result<syn::Type> {
    match expr {
        Expr::Path(ExprPath { path, .. }) => Ok(syn::Type::Path(syn::TypePath {
            qself: None,
            path: path.clone(),
        })),
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => syn::parse_str::<syn::Type>(&s.value()).map_err(|e| syn::Error::new(expr.span(), e)),
        _ => Err(syn::Error::new(expr.span(), "expected type path or string")),
    }
}

fn strip_own_attrs(attrs: &[Attribute]) -> Vec<Attribute> {
    attrs
        .iter()
        .filter(|a| {
            let Meta::Path(p) = &a.meta else {
                return true;
            };
            !(p.is_ident("Task") || p.is_ident("Module"))
        })
        .cloned()
        .collect()
}

fn parse_pairs(attr: TokenStream) -> syn::Result<Vec<(String, Expr, proc_macro2::Span)>> {
    let parser = syn::punctuated::Punctuated::<Meta, Token![,]>::parse_terminated;
    let mut out = Vec::new();
    for m in parser.parse(attr)? {
        let Meta::NameValue(nv) = m else {
            return Err(syn::Error::new(m.span(), "expected key = value"));
        };
        let Some(key) = nv.path.get_ident().map(ToString::to_string) else {
            return Err(syn::Error::new(nv.path.span(), "expected ident key"));
        };
        out.push((key, nv.value, nv.path.span()));
    }
    Ok(out)
}

fn task_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = strip_own_attrs(&st.attrs);
    let ident = st.ident.clone();

    let mut id: Option<String> = None;
    let mut module: Option<String> = None;
    let mut phase: Option<String> = None;
    let mut config_ty: Option<syn::Type> = None;
    let mut config_path: Option<String> = None;
    let mut provides: Vec<String> = Vec::new();
    let mut after: Vec<String> = Vec::new();
    let mut default_label: Option<String> = None;
    let mut core = false;

    for (key, v, span) in parse_pairs(attr)? {
        match key.as_str() {
            "id" => id = Some(lit_str(&v)?),
            "module" => module = Some(lit_str(&v)?),
            "phase" => phase = Some(lit_str(&v)?),
            "config" => config_ty = Some(config_type(&v)?),
            "config_path" => config_path = Some(lit_str(&v)?),
            "provides" => provides = array_strings(&v)?,
            "after" => after = array_strings(&v)?,
            "default_label" => default_label = Some(lit_str(&v)?),
            "core" => core = lit_bool(&v)?,
            other => {
                return Err(syn::Error::new(
                    span,
                    format!("unknown Task attribute key '{other}'"),
                ));
            }
        }
    }

    let missing = |what: &str| syn::Error::new(ident.span(), format!("Task: missing {what}"));
    let id = id.ok_or_else(|| missing("id"))?;
    let module = module.ok_or_else(|| missing("module"))?;
    let phase = phase.ok_or_else(|| missing("phase"))?;
    let default_label = default_label.ok_or_else(|| missing("default_label"))?;
    let config_ty = config_ty.unwrap_or_else(|| parse_quote!(#ident));

    let config_path = match config_path {
        Some(p) => p,
        None => {
            let Some(step) = id.strip_prefix(&format!("{module}.")) else {
                return Err(syn::Error::new(
                    ident.span(),
                    "Task: id must start with '<module>.' when config_path is omitted",
                ));
            };
            format!("{module}.steps.{step}")
        }
    };

    // Core steps carry the stage; switching them off would leave a tree that
    // is neither upstream nor fully overlaid.
    let enabled_check = if core {
        quote! {
            if !cfg.enabled {
                return Err(crate::Error::msg(format!(
                    "[{}].enabled=false is not allowed (core step)",
                    #config_path
                )));
            }
        }
    } else {
        quote! {
            if !cfg.enabled {
                return Ok(());
            }
        }
    };

    let expanded = quote! {
        #st

        impl #ident {
            pub const ID: &'static str = #id;
            pub const MODULE: &'static str = #module;
            pub const PHASE: &'static str = #phase;
            pub const CONFIG_PATH: &'static str = #config_path;
            pub const CORE: bool = #core;

            fn load_step_config(doc: &crate::config::ConfigDoc) -> crate::Result<#config_ty> {
                Ok(doc
                    .deserialize_path::<#config_ty>(#config_path)?
                    .unwrap_or_default())
            }

            pub fn plan(doc: &crate::config::ConfigDoc, plan: &mut crate::planner::Plan) -> crate::Result<()> {
                let cfg = Self::load_step_config(doc)?;
                #enabled_check

                let label = cfg
                    .label
                    .clone()
                    .unwrap_or_else(|| #default_label.to_string());

                plan.add(crate::planner::Task {
                    id: #id.to_string(),
                    label,
                    module: #module.to_string(),
                    phase: #phase.to_string(),
                    after: vec![#(#after.to_string()),*],
                    provides: vec![#(#provides.to_string()),*],
                })
            }

            pub fn exec(doc: &crate::config::ConfigDoc, ctx: &mut crate::executor::ExecCtx) -> crate::Result<()> {
                let cfg = Self::load_step_config(doc)?;
                #enabled_check

                if ctx.dry_run {
                    ctx.log(&format!("DRY-RUN: exec {}", #id));
                    return Ok(());
                }
                Self::run(&cfg, doc, ctx)
            }
        }
    };

    Ok(expanded.into())
}

fn module_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = strip_own_attrs(&st.attrs);
    let ident = st.ident.clone();

    let mut id: Option<String> = None;
    let mut stage: Option<(String, proc_macro2::Span)> = None;
    let mut detect: Option<String> = None;
    let mut tasks: Option<Vec<syn::Path>> = None;

    for (key, v, span) in parse_pairs(attr)? {
        match key.as_str() {
            "id" => id = Some(lit_str(&v)?),
            "stage" => stage = Some((lit_str(&v)?, v.span())),
            "detect" => detect = Some(lit_str(&v)?),
            "tasks" => tasks = Some(array_paths(&v)?),
            other => {
                return Err(syn::Error::new(
                    span,
                    format!("unknown Module attribute key '{other}'"),
                ));
            }
        }
    }

    let missing = |what: &str| syn::Error::new(ident.span(), format!("Module: missing {what}"));
    let id = id.ok_or_else(|| missing("id"))?;
    let (stage, stage_span) = stage.ok_or_else(|| missing("stage"))?;
    let tasks = tasks.ok_or_else(|| missing("tasks"))?;
    let detect = detect.unwrap_or_else(|| id.clone());

    let stage_variant = match stage.as_str() {
        "setup" => format_ident!("Setup"),
        "package" => format_ident!("Package"),
        other => {
            return Err(syn::Error::new(
                stage_span,
                format!("unknown stage '{other}' (expected \"setup\" or \"package\")"),
            ));
        }
    };

    let plan_tasks = tasks.iter().map(|p| quote! { #p::plan(doc, plan)?; });
    let register_tasks = tasks.iter().map(|p| quote! { reg.add(#p::ID, #p::exec)?; });

    let expanded = quote! {
        #st

        impl crate::modules::Module for #ident {
            fn id(&self) -> &'static str {
                #id
            }

            fn stage(&self) -> Option<crate::planner::Stage> {
                Some(crate::planner::Stage::#stage_variant)
            }

            fn detect(&self, doc: &crate::config::ConfigDoc) -> bool {
                doc.has_table_path(#detect)
            }

            fn plan(&self, doc: &crate::config::ConfigDoc, plan: &mut crate::planner::Plan) -> crate::Result<()> {
                #(#plan_tasks)*
                Ok(())
            }
        }

        impl crate::executor::ModuleExec for #ident {
            fn register_tasks(reg: &mut crate::executor::TaskRegistry) -> crate::Result<()> {
                #(#register_tasks)*
                Ok(())
            }
        }
    };

    Ok(expanded.into())
}
