use std::path::PathBuf;

use knuffel::errors::DecodeError;

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Display {
    #[knuffel(child, unwrap(argument), default = String::from("seat0"))]
    pub seat: String,
    /// Skip devices that have no connected output.
    #[knuffel(child)]
    pub require_connector: bool,
    #[knuffel(child, unwrap(argument), default)]
    pub limit_gui_size: GuiSizeLimit,
    #[knuffel(children(name = "ignore-drm-device"), unwrap(argument))]
    pub ignored_drm_devices: Vec<PathBuf>,
}

impl Default for Display {
    fn default() -> Self {
        Self {
            seat: String::from("seat0"),
            require_connector: false,
            limit_gui_size: GuiSizeLimit::default(),
            ignored_drm_devices: Vec::new(),
        }
    }
}

/// Upper bound on the GUI resolution for displays larger than 1920×1080.
///
/// Stored in config as an integer from 0 to 4.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuiSizeLimit {
    /// GUI renders at the native resolution.
    #[default]
    Unlimited,
    /// 1280×720.
    Cap720p,
    /// 1280×720 above 30 Hz, 1920×1080 otherwise.
    Cap720pAbove30Hz,
    /// 1920×1080.
    Cap1080p,
    /// 1920×1080 above 30 Hz, native otherwise.
    Cap1080pAbove30Hz,
}

impl GuiSizeLimit {
    pub fn from_setting(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Unlimited,
            1 => Self::Cap720p,
            2 => Self::Cap720pAbove30Hz,
            3 => Self::Cap1080p,
            4 => Self::Cap1080pAbove30Hz,
            _ => return None,
        })
    }

    pub fn setting(self) -> u8 {
        match self {
            Self::Unlimited => 0,
            Self::Cap720p => 1,
            Self::Cap720pAbove30Hz => 2,
            Self::Cap1080p => 3,
            Self::Cap1080pAbove30Hz => 4,
        }
    }
}

impl<S: knuffel::traits::ErrorSpan> knuffel::DecodeScalar<S> for GuiSizeLimit {
    fn type_check(
        type_name: &Option<knuffel::span::Spanned<knuffel::ast::TypeName, S>>,
        ctx: &mut knuffel::decode::Context<S>,
    ) {
        if let Some(type_name) = &type_name {
            ctx.emit_error(DecodeError::unexpected(
                type_name,
                "type name",
                "no type name expected for this node",
            ));
        }
    }

    fn raw_decode(
        val: &knuffel::span::Spanned<knuffel::ast::Literal, S>,
        ctx: &mut knuffel::decode::Context<S>,
    ) -> Result<GuiSizeLimit, DecodeError<S>> {
        let value = <u8 as knuffel::DecodeScalar<S>>::raw_decode(val, ctx)?;
        match Self::from_setting(value) {
            Some(limit) => Ok(limit),
            None => {
                ctx.emit_error(DecodeError::conversion(
                    val,
                    "limit-gui-size must be between 0 and 4",
                ));
                Ok(Self::default())
            }
        }
    }
}
