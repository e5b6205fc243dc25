use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{quote, quote_spanned};
use syn::spanned::Spanned;
use syn::{Data, DeriveInput, Fields, Lit, parse_macro_input};

/// Parsed `#[column(...)]` options of one field.
#[derive(Default)]
struct ColumnAttrs {
    name: Option<String>,
    external: Option<String>,
    json: bool,
    skip: bool,
}

fn parse_column_attrs(field: &syn::Field) -> syn::Result<ColumnAttrs> {
    let mut attrs = ColumnAttrs::default();
    for attr in &field.attrs {
        if !attr.path().is_ident("column") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                attrs.name = Some(parse_str(&meta)?);
            } else if meta.path.is_ident("external") {
                attrs.external = Some(parse_str(&meta)?);
            } else if meta.path.is_ident("json") {
                attrs.json = true;
            } else if meta.path.is_ident("skip") {
                attrs.skip = true;
            } else {
                return Err(meta.error("expected `name`, `external`, `json` or `skip`"));
            }
            Ok(())
        })?;
    }
    if attrs.json && attrs.external.is_none() {
        return Err(syn::Error::new_spanned(
            field,
            "#[column(json)] needs #[column(external = \"<extension>\")]",
        ));
    }
    Ok(attrs)
}

fn parse_str(meta: &syn::meta::ParseNestedMeta) -> syn::Result<String> {
    meta.input.parse::<syn::Token![=]>()?;
    match meta.input.parse::<Lit>()? {
        Lit::Str(s) => Ok(s.value()),
        other => Err(syn::Error::new_spanned(other, "expected a string literal")),
    }
}

/// Derive macro for the `CacheRow` trait.
///
/// Each named field becomes one logical column, in declaration order. The
/// column kind comes from the field type's `ColumnValue` impl (scalars,
/// `Option` of scalars, and tuples of scalars).
///
/// ## Field attributes
///
/// - `#[column(name = "...")]` - column name (defaults to the field name)
/// - `#[column(external = ".png")]` - store the field in a file as is; the
///   field must be `Vec<u8>`, anything else is a compile error
/// - `#[column(external = ".json", json)]` - store the field in a file as a
///   JSON document; the field can be any `Serialize + DeserializeOwned` type
/// - `#[column(skip)]` - not stored; rebuilt with `Default::default()`
///
/// ## Example
///
/// ```text
/// #[derive(CacheRow)]
/// struct Thumbnail {
///     #[column(external = ".png")]
///     img: Vec<u8>,
///     width: u32,
///     height: u32,
/// }
/// // Use: TableDescriptor::typed::<Thumbnail, _>("thumbnails", ["images"], compute)
/// ```
#[proc_macro_derive(CacheRow, attributes(column))]
pub fn derive_cache_row(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand_cache_row(&input) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(err) => TokenStream::from(err.to_compile_error()),
    }
}

fn expand_cache_row(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    input,
                    "CacheRow only supports structs with named fields",
                ));
            }
        },
        _ => return Err(syn::Error::new_spanned(input, "CacheRow only supports structs")),
    };

    let mut specs = Vec::new();
    let mut into_values = Vec::new();
    let mut field_inits = Vec::new();

    for field in fields.iter() {
        let attrs = parse_column_attrs(field)?;
        let field_name = field
            .ident
            .as_ref()
            .ok_or_else(|| syn::Error::new_spanned(field, "expected a named field"))?;
        let field_ty = &field.ty;

        if attrs.skip {
            field_inits.push(quote! { #field_name: ::core::default::Default::default() });
            continue;
        }

        let column_name = attrs.name.unwrap_or_else(|| field_name.to_string());
        let next = quote! { values.next().unwrap_or(::depcache::Value::Null) };
        let (spec, into_value, from_value) = match (&attrs.external, attrs.json) {
            (Some(ext), true) => (
                quote! {
                    ::depcache::ColumnSpec::external(#column_name, ::depcache::RawBytes::new(#ext))
                },
                quote! { ::depcache::json_to_value(&self.#field_name)? },
                quote! { ::depcache::json_from_value::<#field_ty>(#next)? },
            ),
            // Raw files only hold bytes; any other field type fails to compile here.
            (Some(ext), false) => {
                let bytes_ty = quote_spanned! {field_ty.span()=> ::std::vec::Vec<u8> };
                (
                    quote! {
                        ::depcache::ColumnSpec::external(
                            #column_name,
                            ::depcache::RawBytes::new(#ext),
                        )
                    },
                    quote! {{
                        let bytes: #bytes_ty = self.#field_name;
                        ::depcache::Value::Bytes(bytes)
                    }},
                    quote! { ::depcache::bytes_from_value(#next)? },
                )
            }
            (None, _) => (
                quote! {
                    ::depcache::ColumnSpec::new(
                        #column_name,
                        <#field_ty as ::depcache::ColumnValue>::column_kind(),
                    )
                },
                quote! { ::depcache::ColumnValue::into_value(self.#field_name) },
                quote! { <#field_ty as ::depcache::ColumnValue>::from_value(#next)? },
            ),
        };
        specs.push(spec);
        into_values.push(into_value);
        field_inits.push(quote! { #field_name: #from_value });
    }

    let column_count = specs.len();
    let type_name = name.to_string();

    Ok(quote! {
        impl ::depcache::CacheRow for #name {
            fn columns() -> ::std::vec::Vec<::depcache::ColumnSpec> {
                ::std::vec![#(#specs),*]
            }

            fn into_values(
                self,
            ) -> ::core::result::Result<
                ::std::vec::Vec<::depcache::Value>,
                ::depcache::DepcacheError,
            > {
                ::core::result::Result::Ok(::std::vec![#(#into_values),*])
            }

            fn from_values(
                values: ::std::vec::Vec<::depcache::Value>,
            ) -> ::core::result::Result<Self, ::depcache::DepcacheError> {
                if values.len() != #column_count {
                    return ::core::result::Result::Err(::depcache::DepcacheError::ValueConversion(
                        ::std::format!(
                            "{} has {} columns, got {} values",
                            #type_name,
                            #column_count,
                            values.len()
                        ),
                    ));
                }
                #[allow(unused_mut, unused_variables)]
                let mut values = values.into_iter();
                ::core::result::Result::Ok(Self {
                    #(#field_inits),*
                })
            }
        }
    })
}
