//! Comparison chart rendering.
//!
//! Output is a fixed-size PNG. Text uses DejaVu Sans compiled into the crate,
//! so the bytes depend only on the input data, never on installed fonts or
//! the clock.

use std::{io::Cursor, sync::OnceLock};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use plotters::coord::Shift;
use plotters::prelude::*;
use plotters::style::{
    FontStyle, register_font,
    text_anchor::{HPos, Pos, VPos},
};

use crate::{
    config::{DEFAULT_SIGNATURE, DEFAULT_TIMEZONE},
    model::{AlignedSeries, Comparison, Coordinate, ForecastAxis},
    summary::{self, DaySummary},
};

pub const WIDTH: u32 = 960;
pub const HEIGHT: u32 = 640;

pub const BACKGROUND: RGBColor = RGBColor(236, 243, 252);
pub const MODEL_A_COLOR: RGBColor = RGBColor(200, 40, 40);
pub const MODEL_B_COLOR: RGBColor = RGBColor(30, 90, 200);
const MODEL_A_BAR: RGBColor = RGBColor(236, 160, 160);
const MODEL_B_BAR: RGBColor = RGBColor(150, 180, 232);
const PANEL: RGBColor = RGBColor(255, 255, 255);
const GRID: RGBColor = RGBColor(210, 214, 222);
const ZERO_LINE: RGBColor = RGBColor(150, 150, 160);
const TEXT: RGBColor = RGBColor(20, 20, 20);
const MUTED: RGBColor = RGBColor(110, 110, 110);

const FONT_FAMILY: &str = "DejaVu Sans";
static FONT_REGULAR: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");
static FONT_BOLD: &[u8] = include_bytes!("../assets/DejaVuSans-Bold.ttf");

const PLOT_LEFT: i32 = 56;
const PLOT_WIDTH: i32 = 880;
const TEMP_TOP: i32 = 68;
const TEMP_HEIGHT: i32 = 270;
const PRECIP_TOP: i32 = 346;
const PRECIP_HEIGHT: i32 = 80;
const DAY_LABEL_TOP: i32 = 432;
const TABLE_TOP: i32 = 456;
const ROW_HEIGHT: i32 = 18;
const TABLE_COLUMNS: [i32; 3] = [16, 136, 536];
const TICK_GAP: i32 = 6;

type Area<'a> = DrawingArea<BitMapBackend<'a>, Shift>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("neither provider has any data to plot")]
    NothingToRender,
    #[error("drawing failed: {0}")]
    Draw(String),
    #[error("image encoding failed: {0}")]
    Encode(String),
}

fn draw_err<E: std::fmt::Display>(e: E) -> RenderError {
    RenderError::Draw(e.to_string())
}

/// Fixed presentation settings for a chart.
#[derive(Debug, Clone)]
pub struct RenderStyle {
    pub signature: String,
    pub timezone: Tz,
}

impl Default for RenderStyle {
    fn default() -> Self {
        Self {
            signature: DEFAULT_SIGNATURE.to_string(),
            timezone: DEFAULT_TIMEZONE.parse().unwrap_or(chrono_tz::UTC),
        }
    }
}

/// Render both aligned series as a PNG.
pub fn render_comparison(
    comparison: &Comparison,
    coordinate: &Coordinate,
    style: &RenderStyle,
) -> Result<Vec<u8>, RenderError> {
    if comparison.series().iter().all(|s| s.is_all_missing()) {
        return Err(RenderError::NothingToRender);
    }
    let frame = Frame::new(&comparison.axis).ok_or(RenderError::NothingToRender)?;
    load_fonts()?;

    let mut buf = vec![0u8; (WIDTH * HEIGHT * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buf, (WIDTH, HEIGHT)).into_drawing_area();
        draw(&root, &frame, comparison, coordinate, style)?;
        root.present().map_err(draw_err)?;
    }

    encode_png(buf)
}

fn encode_png(buf: Vec<u8>) -> Result<Vec<u8>, RenderError> {
    let img = image::RgbImage::from_raw(WIDTH, HEIGHT, buf)
        .ok_or_else(|| RenderError::Encode("pixel buffer has the wrong size".into()))?;
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)
        .map_err(|e| RenderError::Encode(e.to_string()))?;
    Ok(out.into_inner())
}

/// Maps axis timestamps to chart x values (hours since the first slot).
struct Frame {
    t0: DateTime<Utc>,
    x_min: f64,
    x_max: f64,
    half_step: f64,
}

impl Frame {
    fn new(axis: &ForecastAxis) -> Option<Self> {
        let ts = axis.timestamps();
        let t0 = *ts.first()?;
        let last = *ts.last()?;
        let half_step = ts.get(1).map(|t1| hours_between(t0, *t1) / 2.0).unwrap_or(1.5);
        Some(Self {
            t0,
            x_min: -half_step,
            x_max: hours_between(t0, last) + half_step,
            half_step,
        })
    }

    fn x(&self, t: DateTime<Utc>) -> f64 {
        hours_between(self.t0, t)
    }

    fn px(&self, x: f64) -> i32 {
        let frac = (x - self.x_min) / (self.x_max - self.x_min);
        PLOT_LEFT + (frac * PLOT_WIDTH as f64).round() as i32
    }

    fn local_midnight(&self, day: NaiveDate, tz: &Tz) -> Option<f64> {
        let local = tz.from_local_datetime(&day.and_hms_opt(0, 0, 0)?).earliest()?;
        Some(self.x(local.with_timezone(&Utc)))
    }
}

fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_seconds() as f64 / 3600.0
}

/// Temperature span rounded out to whole tick steps.
struct TempRange {
    lo: f64,
    hi: f64,
    step: f64,
}

impl TempRange {
    fn covering(comparison: &Comparison) -> Self {
        let (lo, hi) = comparison
            .series()
            .iter()
            .flat_map(|s| s.temperatures().flatten())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), t| (lo.min(t), hi.max(t)));

        let span = hi - lo;
        let step = if span <= 10.0 {
            2.0
        } else if span <= 30.0 {
            5.0
        } else {
            10.0
        };
        Self {
            lo: ((lo - 1.0) / step).floor() * step,
            hi: ((hi + 1.0) / step).ceil() * step,
            step,
        }
    }

    fn ticks(&self) -> impl Iterator<Item = f64> + '_ {
        let count = ((self.hi - self.lo) / self.step).round() as i64;
        (0..=count).map(move |i| self.lo + i as f64 * self.step)
    }
}

fn series_color(index: usize) -> (RGBColor, RGBColor) {
    if index == 0 { (MODEL_A_COLOR, MODEL_A_BAR) } else { (MODEL_B_COLOR, MODEL_B_BAR) }
}

fn draw(
    root: &Area<'_>,
    frame: &Frame,
    comparison: &Comparison,
    coordinate: &Coordinate,
    style: &RenderStyle,
) -> Result<(), RenderError> {
    root.fill(&BACKGROUND).map_err(draw_err)?;

    let title = format!("{}: {}", style.signature, coordinate.display_name());
    draw_text(root, &title, (PLOT_LEFT, 14), &font(18.0, FontStyle::Bold, &TEXT))?;
    draw_legend(root, comparison)?;

    let days = summary::local_days(&comparison.axis, &style.timezone);
    let boundaries: Vec<f64> = days
        .iter()
        .skip(1)
        .filter_map(|d| frame.local_midnight(*d, &style.timezone))
        .collect();

    let temp_area = root.clone().shrink((PLOT_LEFT, TEMP_TOP), (PLOT_WIDTH, TEMP_HEIGHT));
    draw_temperature(root, &temp_area, frame, comparison, &boundaries)?;

    let precip_area = root.clone().shrink((PLOT_LEFT, PRECIP_TOP), (PLOT_WIDTH, PRECIP_HEIGHT));
    draw_precipitation(root, &precip_area, frame, comparison, &boundaries)?;

    draw_day_labels(root, frame, &days, style)?;
    draw_table(root, comparison, &days, style)?;

    draw_text(
        root,
        &style.signature,
        (WIDTH as i32 - 12, HEIGHT as i32 - 20),
        &font(12.0, FontStyle::Normal, &MUTED).pos(Pos::new(HPos::Right, VPos::Top)),
    )?;

    Ok(())
}

fn draw_legend(root: &Area<'_>, comparison: &Comparison) -> Result<(), RenderError> {
    for (i, series) in comparison.series().into_iter().enumerate() {
        let x = PLOT_LEFT + i as i32 * 320;
        let y = 44;
        let (line, _) = series_color(i);
        let label = format!("{} {}", series.provider.model_label(), series.provider.display_name());

        if series.is_all_missing() {
            let muted = font(13.0, FontStyle::Normal, &MUTED);
            draw_text(root, &format!("{label}: unavailable"), (x + 18, y), &muted)?;
        } else {
            root.draw(&Rectangle::new([(x, y), (x + 11, y + 7)], line.filled()))
                .map_err(draw_err)?;
            draw_text(root, &label, (x + 18, y), &font(13.0, FontStyle::Normal, &TEXT))?;
        }
    }
    Ok(())
}

/// Consecutive present slots as chart points; a missing slot ends a run.
fn runs(series: &AlignedSeries, axis: &ForecastAxis, frame: &Frame) -> Vec<Vec<(f64, f64)>> {
    let mut runs = Vec::new();
    let mut current = Vec::new();
    for (t, slot) in axis.timestamps().iter().zip(&series.slots) {
        match slot {
            Some(p) => current.push((frame.x(*t), p.temperature_c)),
            None if !current.is_empty() => runs.push(std::mem::take(&mut current)),
            None => {}
        }
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

fn draw_temperature(
    root: &Area<'_>,
    area: &Area<'_>,
    frame: &Frame,
    comparison: &Comparison,
    boundaries: &[f64],
) -> Result<(), RenderError> {
    area.fill(&PANEL).map_err(draw_err)?;
    let range = TempRange::covering(comparison);

    let mut chart = ChartBuilder::on(area)
        .build_cartesian_2d(frame.x_min..frame.x_max, range.lo..range.hi)
        .map_err(draw_err)?;

    for tick in range.ticks() {
        let color = if tick == 0.0 { ZERO_LINE } else { GRID };
        chart
            .draw_series(std::iter::once(PathElement::new(
                vec![(frame.x_min, tick), (frame.x_max, tick)],
                color.stroke_width(1),
            )))
            .map_err(draw_err)?;

        let label = format!("{}", tick.round() as i64);
        let (_, py) = chart.backend_coord(&(frame.x_min, tick));
        draw_text(root, &label, (PLOT_LEFT - TICK_GAP, py), &axis_label(&TEXT, VPos::Center))?;
    }
    draw_text(root, "°C", (PLOT_LEFT - TICK_GAP, TEMP_TOP - 4), &axis_label(&MUTED, VPos::Bottom))?;

    for x in boundaries {
        chart
            .draw_series(std::iter::once(PathElement::new(
                vec![(*x, range.lo), (*x, range.hi)],
                GRID.stroke_width(1),
            )))
            .map_err(draw_err)?;
    }

    for (i, series) in comparison.series().into_iter().enumerate() {
        let (line, _) = series_color(i);
        for run in runs(series, &comparison.axis, frame) {
            if run.len() > 1 {
                chart
                    .draw_series(LineSeries::new(run.iter().copied(), line.stroke_width(2)))
                    .map_err(draw_err)?;
            }
            chart
                .draw_series(run.iter().map(|p| Circle::new(*p, 3, line.filled())))
                .map_err(draw_err)?;
        }
    }

    Ok(())
}

fn draw_precipitation(
    root: &Area<'_>,
    area: &Area<'_>,
    frame: &Frame,
    comparison: &Comparison,
    boundaries: &[f64],
) -> Result<(), RenderError> {
    area.fill(&PANEL).map_err(draw_err)?;

    let max = comparison
        .series()
        .iter()
        .flat_map(|s| s.slots.iter().flatten().map(|p| p.precipitation_mm))
        .fold(0.0_f64, f64::max);
    let top = max.max(1.0) * 1.1;

    let mut chart = ChartBuilder::on(area)
        .build_cartesian_2d(frame.x_min..frame.x_max, 0.0..top)
        .map_err(draw_err)?;

    for x in boundaries {
        chart
            .draw_series(std::iter::once(PathElement::new(
                vec![(*x, 0.0), (*x, top)],
                GRID.stroke_width(1),
            )))
            .map_err(draw_err)?;
    }

    let width = frame.half_step * 0.8;
    for (i, series) in comparison.series().into_iter().enumerate() {
        let (_, bar) = series_color(i);
        let bars = comparison
            .axis
            .timestamps()
            .iter()
            .zip(&series.slots)
            .filter_map(|(t, slot)| slot.as_ref().map(|p| (frame.x(*t), p.precipitation_mm)))
            .filter(|(_, mm)| *mm > 0.0)
            .map(|(x, mm)| {
                let (x0, x1) = if i == 0 { (x - width, x) } else { (x, x + width) };
                Rectangle::new([(x0, 0.0), (x1, mm)], bar.filled())
            });
        chart.draw_series(bars).map_err(draw_err)?;
    }

    let label = format!("{max:.1}");
    draw_text(root, &label, (PLOT_LEFT - TICK_GAP, PRECIP_TOP), &axis_label(&TEXT, VPos::Top))?;
    draw_text(root, "mm", (PLOT_LEFT - TICK_GAP, PRECIP_TOP + 16), &axis_label(&MUTED, VPos::Top))?;

    Ok(())
}

fn draw_day_labels(
    root: &Area<'_>,
    frame: &Frame,
    days: &[NaiveDate],
    style: &RenderStyle,
) -> Result<(), RenderError> {
    for (i, day) in days.iter().enumerate() {
        let start = if i == 0 {
            frame.x_min
        } else {
            frame.local_midnight(*day, &style.timezone).unwrap_or(frame.x_min)
        };
        let end = days
            .get(i + 1)
            .and_then(|next| frame.local_midnight(*next, &style.timezone))
            .unwrap_or(frame.x_max);

        let label = day.format("%a %d").to_string();
        let (left, right) = (frame.px(start.max(frame.x_min)), frame.px(end.min(frame.x_max)));
        let text = font(12.0, FontStyle::Normal, &TEXT);
        if right - left < text_width(root, &label, &text)? + 4 {
            continue;
        }
        let centered = text.pos(Pos::new(HPos::Center, VPos::Top));
        draw_text(root, &label, ((left + right) / 2, DAY_LABEL_TOP), &centered)?;
    }

    let zone = format!("local time, {}", style.timezone.name());
    draw_text(
        root,
        &zone,
        (PLOT_LEFT + PLOT_WIDTH, DAY_LABEL_TOP + 14),
        &font(11.0, FontStyle::Normal, &MUTED).pos(Pos::new(HPos::Right, VPos::Top)),
    )
}

fn format_summary(summary: Option<&DaySummary>) -> String {
    match summary {
        Some(s) => format!(
            "{}..{}°C  {:.1} mm  {} {:.1} m/s",
            s.temp_min.round() as i64,
            s.temp_max.round() as i64,
            s.precipitation_mm,
            summary::compass(s.wind_dir_deg),
            s.wind_mean_ms,
        ),
        None => "-".to_string(),
    }
}

fn draw_table(
    root: &Area<'_>,
    comparison: &Comparison,
    days: &[NaiveDate],
    style: &RenderStyle,
) -> Result<(), RenderError> {
    let headers = [
        "Day".to_string(),
        comparison.model_a.provider.to_string(),
        comparison.model_b.provider.to_string(),
    ];
    for (x, header) in TABLE_COLUMNS.iter().zip(&headers) {
        draw_text(root, header, (*x, TABLE_TOP), &font(13.0, FontStyle::Bold, &TEXT))?;
    }
    root.draw(&PathElement::new(
        vec![(TABLE_COLUMNS[0], TABLE_TOP + 14), (WIDTH as i32 - 16, TABLE_TOP + 14)],
        GRID.stroke_width(1),
    ))
    .map_err(draw_err)?;

    let a = summary::summarize(&comparison.model_a, &comparison.axis, &style.timezone, days);
    let b = summary::summarize(&comparison.model_b, &comparison.axis, &style.timezone, days);

    for (row, day) in days.iter().enumerate() {
        let y = TABLE_TOP + (row as i32 + 1) * ROW_HEIGHT;
        let cells = [
            day.format("%a %d %b").to_string(),
            format_summary(a[row].as_ref()),
            format_summary(b[row].as_ref()),
        ];
        for (x, cell) in TABLE_COLUMNS.iter().zip(&cells) {
            draw_text(root, cell, (*x, y), &font(12.0, FontStyle::Normal, &TEXT))?;
        }
    }
    Ok(())
}

/// Registers the embedded faces with plotters once per process.
fn load_fonts() -> Result<(), RenderError> {
    static LOADED: OnceLock<bool> = OnceLock::new();
    let loaded = *LOADED.get_or_init(|| {
        register_font(FONT_FAMILY, FontStyle::Normal, FONT_REGULAR).is_ok()
            && register_font(FONT_FAMILY, FontStyle::Bold, FONT_BOLD).is_ok()
    });
    if loaded { Ok(()) } else { Err(RenderError::Draw("embedded font is unreadable".into())) }
}

fn font(size: f64, weight: FontStyle, color: &RGBColor) -> TextStyle<'static> {
    (FONT_FAMILY, size, weight).into_font().color(color)
}

/// Right-aligned label for the left of a plot panel.
fn axis_label(color: &RGBColor, v: VPos) -> TextStyle<'static> {
    font(11.0, FontStyle::Normal, color).pos(Pos::new(HPos::Right, v))
}

fn text_width(root: &Area<'_>, text: &str, style: &TextStyle<'_>) -> Result<i32, RenderError> {
    let (w, _) = root.estimate_text_size(text, style).map_err(draw_err)?;
    Ok(w as i32)
}

fn draw_text(
    root: &Area<'_>,
    text: &str,
    pos: (i32, i32),
    style: &TextStyle<'_>,
) -> Result<(), RenderError> {
    root.draw_text(text, style, pos).map_err(draw_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ForecastPoint;
    use crate::normalize::AlignmentPolicy;
    use crate::provider::ProviderId;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 7, 40, 0).unwrap()
    }

    fn aligned(provider: ProviderId, axis: &ForecastAxis, offset: f64) -> AlignedSeries {
        let slots = axis
            .timestamps()
            .iter()
            .enumerate()
            .map(|(i, t)| {
                Some(ForecastPoint {
                    timestamp: *t,
                    temperature_c: offset + (i as f64 / 3.0).sin() * 6.0,
                    precipitation_mm: if i % 5 == 0 { 1.5 } else { 0.0 },
                    wind_speed_ms: 3.0,
                    wind_dir_deg: Some(200.0),
                    cloud_pct: None,
                })
            })
            .collect();
        AlignedSeries { provider, slots }
    }

    fn comparison() -> Comparison {
        let axis = AlignmentPolicy::default().build_axis(now());
        Comparison {
            model_a: aligned(ProviderId::MetNo, &axis, -2.0),
            model_b: aligned(ProviderId::OpenWeather, &axis, 1.0),
            axis,
        }
    }

    fn coordinate() -> Coordinate {
        Coordinate::new(55.75, 37.62, "Moscow").unwrap()
    }

    fn contains_color(png: &[u8], color: RGBColor) -> bool {
        let img = image::load_from_memory(png).expect("valid png").to_rgb8();
        img.pixels().any(|p| p.0 == [color.0, color.1, color.2])
    }

    #[test]
    fn renders_fixed_size_png() {
        let png = render_comparison(&comparison(), &coordinate(), &RenderStyle::default())
            .expect("renders");

        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
        let img = image::load_from_memory(&png).unwrap();
        assert_eq!((img.width(), img.height()), (WIDTH, HEIGHT));
    }

    #[test]
    fn identical_input_gives_identical_bytes() {
        let cmp = comparison();
        let style = RenderStyle::default();

        let first = render_comparison(&cmp, &coordinate(), &style).unwrap();
        let second = render_comparison(&cmp.clone(), &coordinate(), &style).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn different_data_gives_different_bytes() {
        let cmp = comparison();
        let mut shifted = cmp.clone();
        shifted.model_b = aligned(ProviderId::OpenWeather, &cmp.axis, 4.0);

        let style = RenderStyle::default();
        assert_ne!(
            render_comparison(&cmp, &coordinate(), &style).unwrap(),
            render_comparison(&shifted, &coordinate(), &style).unwrap()
        );
    }

    #[test]
    fn both_series_missing_is_nothing_to_render() {
        let axis = AlignmentPolicy::default().build_axis(now());
        let cmp = Comparison {
            model_a: AlignedSeries::all_missing(ProviderId::MetNo, axis.len()),
            model_b: AlignedSeries::all_missing(ProviderId::OpenWeather, axis.len()),
            axis,
        };

        let err = render_comparison(&cmp, &coordinate(), &RenderStyle::default()).unwrap_err();
        assert_eq!(err, RenderError::NothingToRender);
    }

    #[test]
    fn cyrillic_place_names_get_their_own_title() {
        let cmp = comparison();
        let style = RenderStyle::default();
        let moscow = Coordinate::new(55.75, 37.62, "Москва").unwrap();
        let samara = Coordinate::new(53.2, 50.15, "Самара").unwrap();

        let a = render_comparison(&cmp, &moscow, &style).unwrap();
        let b = render_comparison(&cmp, &samara, &style).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn missing_provider_leaves_no_trace_of_its_colour() {
        let mut cmp = comparison();
        cmp.model_a = AlignedSeries::all_missing(ProviderId::MetNo, cmp.axis.len());

        let png = render_comparison(&cmp, &coordinate(), &RenderStyle::default()).unwrap();
        assert!(!contains_color(&png, MODEL_A_COLOR));
        assert!(contains_color(&png, MODEL_B_COLOR));

        let both = render_comparison(&comparison(), &coordinate(), &RenderStyle::default())
            .unwrap();
        assert!(contains_color(&both, MODEL_A_COLOR));
    }

    #[test]
    fn gaps_split_lines_into_runs() {
        let cmp = comparison();
        let mut series = cmp.model_a.clone();
        series.slots[3] = None;
        series.slots[4] = None;
        series.slots[10] = None;

        let frame = Frame::new(&cmp.axis).unwrap();
        let runs = runs(&series, &cmp.axis, &frame);

        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].len(), 3);
        assert_eq!(runs[1].len(), 5);
        assert_eq!(runs.iter().map(Vec::len).sum::<usize>(), cmp.axis.len() - 3);
    }

    #[test]
    fn temp_range_rounds_out_to_ticks() {
        let range = TempRange::covering(&comparison());
        assert!(range.lo <= -8.0);
        assert!(range.hi >= 7.0);
        assert_eq!(range.lo % range.step, 0.0);
        assert!(range.ticks().count() >= 2);
    }

    #[test]
    fn summary_cell_formats_compass_and_units() {
        let cell = format_summary(Some(&DaySummary {
            temp_min: -3.4,
            temp_max: 5.6,
            precipitation_mm: 1.25,
            wind_mean_ms: 4.0,
            wind_dir_deg: Some(45.0),
        }));
        assert!(cell.contains("-3..6"));
        assert!(cell.contains("NE"));
        assert!(cell.contains("m/s"));
        assert_eq!(format_summary(None), "-");
    }
}
