use syn::{Attribute, Error, Ident, LitInt, LitStr, Result, meta::ParseNestedMeta};

const ATTRIBUTE: &str = "docmap";

///
/// ContainerAttrs
///

#[derive(Default)]
pub struct ContainerAttrs {
    pub name: Option<LitStr>,
    pub collection: Option<LitStr>,
    pub pre_persist: Option<Ident>,
    pub post_persist: Option<Ident>,
    pub post_load: Option<Ident>,
    pub capped: Option<Capped>,
}

pub struct Capped {
    pub size: LitInt,
    pub max: Option<LitInt>,
}

impl ContainerAttrs {
    pub fn parse(attrs: &[Attribute]) -> Result<Self> {
        let mut parsed = Self::default();

        for attr in docmap_attrs(attrs) {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("name") {
                    parsed.name = Some(meta.value()?.parse()?);
                } else if meta.path.is_ident("collection") {
                    parsed.collection = Some(meta.value()?.parse()?);
                } else if meta.path.is_ident("pre_persist") {
                    parsed.pre_persist = Some(method_name(&meta)?);
                } else if meta.path.is_ident("post_persist") {
                    parsed.post_persist = Some(method_name(&meta)?);
                } else if meta.path.is_ident("post_load") {
                    parsed.post_load = Some(method_name(&meta)?);
                } else if meta.path.is_ident("capped") {
                    parsed.capped = Some(parse_capped(&meta)?);
                } else {
                    return Err(meta.error("unsupported docmap container attribute"));
                }
                Ok(())
            })?;
        }

        Ok(parsed)
    }
}

fn method_name(meta: &ParseNestedMeta<'_>) -> Result<Ident> {
    let name: LitStr = meta.value()?.parse()?;
    name.parse()
}

fn parse_capped(meta: &ParseNestedMeta<'_>) -> Result<Capped> {
    let mut size = None;
    let mut max = None;

    meta.parse_nested_meta(|nested| {
        if nested.path.is_ident("size") {
            size = Some(nested.value()?.parse()?);
        } else if nested.path.is_ident("max") {
            max = Some(nested.value()?.parse()?);
        } else {
            return Err(nested.error("expected `size` or `max`"));
        }
        Ok(())
    })?;

    let size = size.ok_or_else(|| meta.error("capped collections require a `size`"))?;
    Ok(Capped { size, max })
}

///
/// FieldAttrs
///

#[derive(Default)]
pub struct FieldAttrs {
    pub id: bool,
    pub embedded: bool,
    pub reference: bool,
    pub lazy: bool,
    pub transient: bool,
    pub convert: bool,
    pub store_null: bool,
    pub rename: Option<LitStr>,
    pub indexed: Option<Indexed>,
}

#[derive(Default)]
pub struct Indexed {
    pub unique: bool,
    pub desc: bool,
    pub drop_dups: bool,
    pub name: Option<LitStr>,
}

impl FieldAttrs {
    pub fn parse(attrs: &[Attribute]) -> Result<Self> {
        let mut parsed = Self::default();

        for attr in docmap_attrs(attrs) {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("id") {
                    parsed.id = true;
                } else if meta.path.is_ident("embedded") {
                    parsed.embedded = true;
                } else if meta.path.is_ident("reference") {
                    parsed.reference = true;
                    if meta.input.peek(syn::token::Paren) {
                        meta.parse_nested_meta(|nested| {
                            if nested.path.is_ident("lazy") {
                                parsed.lazy = true;
                                Ok(())
                            } else {
                                Err(nested.error("expected `lazy`"))
                            }
                        })?;
                    }
                } else if meta.path.is_ident("lazy") {
                    parsed.reference = true;
                    parsed.lazy = true;
                } else if meta.path.is_ident("transient") {
                    parsed.transient = true;
                } else if meta.path.is_ident("convert") {
                    parsed.convert = true;
                } else if meta.path.is_ident("store_null") {
                    parsed.store_null = true;
                } else if meta.path.is_ident("rename") {
                    parsed.rename = Some(meta.value()?.parse()?);
                } else if meta.path.is_ident("indexed") {
                    parsed.indexed = Some(parse_indexed(&meta)?);
                } else {
                    return Err(meta.error("unsupported docmap field attribute"));
                }
                Ok(())
            })?;
        }

        if parsed.transient && (parsed.id || parsed.reference || parsed.indexed.is_some()) {
            let attr = docmap_attrs(attrs).next();
            return Err(Error::new_spanned(
                attr,
                "transient fields cannot also be ids, references or indexed",
            ));
        }

        if parsed.reference && (parsed.embedded || parsed.convert) {
            let attr = docmap_attrs(attrs).next();
            return Err(Error::new_spanned(
                attr,
                "reference fields cannot also be embedded or converted",
            ));
        }

        Ok(parsed)
    }
}

fn parse_indexed(meta: &ParseNestedMeta<'_>) -> Result<Indexed> {
    let mut indexed = Indexed::default();

    if meta.input.peek(syn::token::Paren) {
        meta.parse_nested_meta(|nested| {
            if nested.path.is_ident("unique") {
                indexed.unique = true;
            } else if nested.path.is_ident("desc") {
                indexed.desc = true;
            } else if nested.path.is_ident("drop_dups") {
                indexed.drop_dups = true;
            } else if nested.path.is_ident("name") {
                indexed.name = Some(nested.value()?.parse()?);
            } else {
                return Err(nested.error("expected `unique`, `desc`, `drop_dups` or `name`"));
            }
            Ok(())
        })?;
    }

    Ok(indexed)
}

///
/// VariantAttrs
///

#[derive(Default)]
pub struct VariantAttrs {
    pub rename: Option<LitStr>,
}

impl VariantAttrs {
    pub fn parse(attrs: &[Attribute]) -> Result<Self> {
        let mut parsed = Self::default();

        for attr in docmap_attrs(attrs) {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("rename") {
                    parsed.rename = Some(meta.value()?.parse()?);
                    Ok(())
                } else {
                    Err(meta.error("unsupported docmap variant attribute"))
                }
            })?;
        }

        Ok(parsed)
    }
}

fn docmap_attrs(attrs: &[Attribute]) -> impl Iterator<Item = &Attribute> {
    attrs.iter().filter(|attr| attr.path().is_ident(ATTRIBUTE))
}
