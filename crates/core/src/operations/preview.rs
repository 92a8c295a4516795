use axum::extract::State;
use axum::Json;
use tracing::info;

use super::Operation;
use crate::preview::{PREVIEW_DIR, PREVIEW_SOURCE};
use crate::server::{AppError, AppState, PreviewPage, PreviewResponse, RequestContext};
use crate::tools::page_count;
use crate::upload::UploadForm;

/// Answers with one image URL per page. Images are rendered in the background
/// when eager rendering is on, and on first request otherwise.
pub(super) async fn preview(
    State(state): State<AppState>,
    ctx: RequestContext,
    form: UploadForm,
) -> Result<Json<PreviewResponse>, AppError> {
    let part = form.require_file("file")?;

    let op = Operation::with_input("preview", &state, part, PREVIEW_SOURCE).await?;
    let pages = page_count(op.tools(), op.dir(), PREVIEW_SOURCE)
        .await
        .map_err(op.fail("failed to read page count"))?;
    op.create_dir(PREVIEW_DIR).await?;

    let job = op.job().id();
    let pages_out = (1..=pages)
        .map(|page_number| -> Result<PreviewPage, AppError> {
            Ok(PreviewPage {
                page_number,
                image_url: ctx.preview_url(job, page_number)?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if state.config().preview.eager_render {
        state.renderer().spawn_render_all(op.job().clone(), pages);
    }
    info!(operation = "preview", job = %job, pages, "preview ready");
    Ok(Json(PreviewResponse { pages: pages_out }))
}
