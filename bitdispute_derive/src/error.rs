//! `#[derive(Error)]`.
//!
//! ```ignore
//! #[derive(Debug, Error)]
//! pub enum CommitmentError {
//!     #[error("value {value} does not fit in {width}")]
//!     ValueOutOfRange { value: u64, width: Width },
//!     #[error("unknown symbol {0}")]
//!     UnknownSymbol(Symbol),
//! }
//! ```
//!
//! Tuple fields are referenced positionally (`{0}`), named fields by name.
//! Fields that the message does not mention are left out of the format call.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{Attribute, Data, DeriveInput, Fields, LitStr, parse_macro_input};

pub fn derive_error(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let body = match &input.data {
        Data::Enum(data) => {
            let arms = data
                .variants
                .iter()
                .map(|variant| {
                    let ident = &variant.ident;
                    let message = message(&variant.attrs, variant)?;
                    let (pattern, write) = format_fields(&message, &variant.fields);
                    Ok(quote! { Self::#ident #pattern => #write, })
                })
                .collect::<syn::Result<Vec<_>>>()?;
            quote! {
                match self {
                    #(#arms)*
                }
            }
        }
        Data::Struct(data) => {
            let message = message(&input.attrs, input)?;
            let (pattern, write) = format_fields(&message, &data.fields);
            quote! {
                let Self #pattern = self;
                #write
            }
        }
        Data::Union(_) => {
            return Err(syn::Error::new_spanned(
                input,
                "Error cannot be derived for unions",
            ));
        }
    };

    Ok(quote! {
        impl #impl_generics ::std::fmt::Display for #name #ty_generics #where_clause {
            #[allow(unused_variables)]
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                #body
            }
        }

        impl #impl_generics ::std::error::Error for #name #ty_generics #where_clause {}
    })
}

/// Builds the destructuring pattern and the `write!` call for one message.
fn format_fields(message: &LitStr, fields: &Fields) -> (TokenStream2, TokenStream2) {
    let text = message.value();
    match fields {
        Fields::Unit => (quote! {}, quote! { write!(f, #message) }),
        Fields::Named(named) => {
            let idents: Vec<_> = named.named.iter().filter_map(|f| f.ident.clone()).collect();
            let used: Vec<_> = idents
                .iter()
                .filter(|ident| mentions(&text, &ident.to_string()))
                .collect();
            (
                quote! { { #(#idents),* } },
                quote! { write!(f, #message, #(#used = #used),*) },
            )
        }
        Fields::Unnamed(unnamed) => {
            let idents: Vec<_> = (0..unnamed.unnamed.len())
                .map(|i| format_ident!("f{}", i))
                .collect();
            let mut rewritten = text.clone();
            let mut used = Vec::new();
            for (i, ident) in idents.iter().enumerate() {
                let position = i.to_string();
                if mentions(&text, &position) {
                    rewritten = rewritten
                        .replace(&format!("{{{position}}}"), &format!("{{{ident}}}"))
                        .replace(&format!("{{{position}:"), &format!("{{{ident}:"));
                    used.push(ident.clone());
                }
            }
            let rewritten = LitStr::new(&rewritten, message.span());
            (
                quote! { ( #(#idents),* ) },
                quote! { write!(f, #rewritten, #(#used = #used),*) },
            )
        }
    }
}

/// True if `{name}` or `{name:...}` appears in the format string.
fn mentions(text: &str, name: &str) -> bool {
    text.contains(&format!("{{{name}}}")) || text.contains(&format!("{{{name}:"))
}

fn message<T: quote::ToTokens>(attrs: &[Attribute], target: &T) -> syn::Result<LitStr> {
    let attr = attrs
        .iter()
        .find(|attr| attr.path().is_ident("error"))
        .ok_or_else(|| syn::Error::new_spanned(target, "missing #[error(\"...\")] attribute"))?;
    attr.parse_args::<LitStr>()
}
