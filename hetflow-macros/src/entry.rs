use proc_macro2::{Span, TokenStream};
use quote::{quote, quote_spanned};
use syn::parse::Parser;
use syn::spanned::Spanned;
use syn::{Attribute, ItemFn};

// syn::AttributeArgs does not implement syn::Parse
type AttributeArgs = syn::punctuated::Punctuated<syn::Meta, syn::Token![,]>;

#[derive(Default)]
struct FinalConfig {
    worker_threads: Option<usize>,
}

struct ConfigBuilder {
    worker_threads: Option<(usize, Span)>,
    is_test: bool,
}

impl ConfigBuilder {
    fn new(is_test: bool) -> Self {
        ConfigBuilder {
            worker_threads: None,
            is_test,
        }
    }

    fn macro_name(&self) -> &'static str {
        if self.is_test {
            "hetflow::test"
        } else {
            "hetflow::main"
        }
    }

    fn set_worker_threads(&mut self, lit: &syn::Lit, span: Span) -> Result<(), syn::Error> {
        if self.worker_threads.is_some() {
            return Err(syn::Error::new(
                span,
                "`worker_threads` set multiple times.",
            ));
        }

        let worker_threads = match lit {
            syn::Lit::Int(int) => int.base10_parse::<usize>().map_err(|e| {
                syn::Error::new(
                    span,
                    format!("Failed to parse value of `worker_threads` as integer: {e}"),
                )
            })?,
            _ => {
                return Err(syn::Error::new(
                    span,
                    "Failed to parse value of `worker_threads` as integer.",
                ));
            }
        };

        if worker_threads == 0 {
            return Err(syn::Error::new(span, "`worker_threads` may not be 0."));
        }
        self.worker_threads = Some((worker_threads, span));

        Ok(())
    }

    fn build(&self) -> FinalConfig {
        FinalConfig {
            worker_threads: self.worker_threads.map(|(n, _)| n),
        }
    }
}

pub(crate) fn main(args: TokenStream, item: TokenStream) -> TokenStream {
    // On failure we still expand to something close to the input, so that
    // IDE completions keep working.
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    let config = AttributeArgs::parse_terminated
        .parse2(args)
        .and_then(|args| build_config(&input, args, false));

    match config {
        Ok(config) => expand(input, false, config),
        Err(e) => token_stream_with_error(expand(input, false, FinalConfig::default()), e),
    }
}

pub(crate) fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    let config = if let Some(attr) = input.attrs.iter().find(|attr| is_test_attribute(attr)) {
        let msg = "second test attribute is supplied, consider removing or changing the order of your test attributes";
        Err(syn::Error::new_spanned(attr, msg))
    } else {
        AttributeArgs::parse_terminated
            .parse2(args)
            .and_then(|args| build_config(&input, args, true))
    };

    match config {
        Ok(config) => expand(input, true, config),
        Err(e) => token_stream_with_error(expand(input, true, FinalConfig::default()), e),
    }
}

fn build_config(
    input: &ItemFn,
    args: AttributeArgs,
    is_test: bool,
) -> Result<FinalConfig, syn::Error> {
    if let Some(asyncness) = input.sig.asyncness {
        let msg = "hetflow entry points are synchronous, remove the `async` keyword";
        return Err(syn::Error::new_spanned(asyncness, msg));
    }

    if !input.sig.inputs.is_empty() {
        let msg = "the function cannot accept arguments";
        return Err(syn::Error::new_spanned(&input.sig.inputs, msg));
    }

    let mut config = ConfigBuilder::new(is_test);

    for arg in args {
        match arg {
            syn::Meta::NameValue(namevalue) => {
                let ident = namevalue
                    .path
                    .get_ident()
                    .ok_or_else(|| {
                        syn::Error::new_spanned(&namevalue, "Must have specified ident")
                    })?
                    .to_string()
                    .to_lowercase();
                let lit = match &namevalue.value {
                    syn::Expr::Lit(syn::ExprLit { lit, .. }) => lit,
                    expr => return Err(syn::Error::new_spanned(expr, "Must be a literal")),
                };
                match ident.as_str() {
                    "worker_threads" => config.set_worker_threads(lit, lit.span())?,
                    name => {
                        let msg = format!(
                            "Unknown attribute {name} is specified; expected `worker_threads` in #[{}]",
                            config.macro_name()
                        );
                        return Err(syn::Error::new_spanned(namevalue, msg));
                    }
                }
            }
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "Unknown attribute inside the macro",
                ));
            }
        }
    }

    Ok(config.build())
}

fn expand(mut input: ItemFn, is_test: bool, config: FinalConfig) -> TokenStream {
    input.sig.asyncness = None;

    // Type mismatches are reported on the last statement.
    let span = input
        .block
        .stmts
        .last()
        .map_or_else(Span::call_site, |stmt| stmt.span());

    let mut rt = quote_spanned! {span=>
        hetflow::runtime::Builder::new()
    };

    if let Some(v) = config.worker_threads {
        rt = quote_spanned! {span=> #rt.worker_threads(#v) };
    }

    let output_type = match &input.sig.output {
        syn::ReturnType::Default => quote! { () },
        syn::ReturnType::Type(_, ret_type) => quote! { #ret_type },
    };

    let body = &input.block;
    let block = quote_spanned! {span=>
        {
            let body = move || -> #output_type #body;

            #[allow(clippy::expect_used, clippy::needless_return)]
            {
                return #rt
                    .try_build()
                    .expect("Failed building the Runtime")
                    .block_on(body);
            }
        }
    };

    input.block = match syn::parse2(block) {
        Ok(block) => Box::new(block),
        Err(e) => return e.into_compile_error(),
    };

    if is_test {
        input.attrs.push(syn::parse_quote! { #[::core::prelude::v1::test] });
    }

    quote! { #input }
}

fn is_test_attribute(attr: &Attribute) -> bool {
    let syn::Meta::Path(path) = &attr.meta else {
        return false;
    };

    if path.leading_colon.is_none()
        && path.segments.len() == 1
        && path.segments[0].arguments.is_none()
        && path.segments[0].ident == "test"
    {
        return true;
    }

    let candidates = [
        ["core", "prelude", "*", "test"],
        ["std", "prelude", "*", "test"],
    ];
    path.segments.len() == candidates[0].len()
        && candidates.into_iter().any(|segments| {
            path.segments.iter().zip(segments).all(|(segment, expected)| {
                segment.arguments.is_none() && (expected == "*" || segment.ident == expected)
            })
        })
}

fn token_stream_with_error(mut tokens: TokenStream, error: syn::Error) -> TokenStream {
    tokens.extend(error.into_compile_error());
    tokens
}
