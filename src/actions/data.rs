//! Data actions: they shape how the rule matches (t, capture, multiMatch,
//! chain, status) and have no runtime effect of their own.

use super::{ActionKind, RuleAction, RuleMetadata};
use crate::engine::Transaction;
use crate::error::{Error, Result};

macro_rules! data_action {
    ($(#[$doc:meta])* $ty:ident, $name:literal, |$meta:ident, $arg:ident| $body:block) => {
        $(#[$doc])*
        #[derive(Debug, Default)]
        pub struct $ty;

        impl RuleAction for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            fn kind(&self) -> ActionKind {
                ActionKind::Data
            }

            fn init(&mut self, $meta: &mut RuleMetadata, $arg: &str) -> Result<()> $body

            fn evaluate(&self, _: &RuleMetadata, _: &mut Transaction) {}
        }
    };
}

data_action!(
    /// `t:name`. `t:none` drops everything collected so far, including the
    /// defaults inherited from SecDefaultAction.
    TransformationAction, "t", |meta, arg| {
        let name = arg.trim();
        if name.is_empty() {
            return Err(Error::InvalidActionArgument {
                action: "t".to_string(),
                message: "missing transformation name".to_string(),
            });
        }
        if name.eq_ignore_ascii_case("none") {
            meta.transformations.clear();
        } else {
            meta.transformations.push(name.to_string());
        }
        Ok(())
    }
);

data_action!(
    /// `capture`
    CaptureAction, "capture", |meta, _arg| {
        meta.capture = true;
        Ok(())
    }
);

data_action!(
    /// `multiMatch`
    MultiMatchAction, "multimatch", |meta, _arg| {
        meta.multi_match = true;
        Ok(())
    }
);

data_action!(
    /// `chain`
    ChainAction, "chain", |meta, _arg| {
        meta.chain = true;
        Ok(())
    }
);

data_action!(
    /// `status:N`
    StatusAction, "status", |meta, arg| {
        match arg.trim().parse::<u16>() {
            Ok(status) if (100..1000).contains(&status) => {
                meta.status = Some(status);
                Ok(())
            }
            _ => Err(Error::InvalidActionArgument {
                action: "status".to_string(),
                message: format!("invalid HTTP status {:?}", arg),
            }),
        }
    }
);
