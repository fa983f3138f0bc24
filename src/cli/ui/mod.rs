mod catalog_view;
mod gear_view;
mod painter;
mod queue_view;
mod spinner;
mod table;

pub(crate) use self::catalog_view::CatalogView;
pub(crate) use self::gear_view::{ScanResultsView, StatusLineView};
pub(crate) use self::painter::Painter;
pub(crate) use self::queue_view::QueueView;
pub(crate) use self::spinner::Spinner;
