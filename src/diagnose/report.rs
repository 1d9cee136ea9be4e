//! The exit report: for every allocation site, the top-K diagnosed objects
//! in score order, each with its worst cache lines and pages attached. Text
//! goes to stderr, or to the configured report file.

use std::fs::File;
use std::io::{self, BufWriter, Write};

use super::diagnosis::{CacheLineSummary, ObjectDiagnosis, PageDiagnosis, SharingCause};
use crate::profiler::NumaSight;

pub fn emit(engine: &NumaSight) {
    let path = engine.options().report_file.value.clone();
    if path.is_empty() {
        let stderr = io::stderr();
        let mut out = stderr.lock();
        if let Err(e) = write_report(engine, &mut out) {
            warn!("failed to write report to stderr: {}", e);
        }
        return;
    }
    match File::create(&path) {
        Ok(file) => {
            let mut out = BufWriter::new(file);
            if let Err(e) = write_report(engine, &mut out) {
                warn!("failed to write report to {}: {}", path, e);
            }
        }
        Err(e) => {
            warn!("cannot create report file {}: {}, using stderr", path, e);
            let stderr = io::stderr();
            let mut out = stderr.lock();
            let _ = write_report(engine, &mut out);
        }
    }
}

pub fn write_report<W: Write>(engine: &NumaSight, out: &mut W) -> io::Result<()> {
    writeln!(out, "======== numasight report ========")?;
    writeln!(
        out,
        "objects still live at exit: {}",
        engine.registry().live_objects()
    )?;

    engine.with_call_sites(|sites| {
        let mut ranked: Vec<_> = sites.values().collect();
        ranked.sort_by(|a, b| {
            b.best_score()
                .cmp(&a.best_score())
                .then(a.call_site().cmp(&b.call_site()))
        });

        for site in ranked {
            writeln!(out)?;
            writeln!(
                out,
                "call site #{}: {} objects diagnosed, worst score {}",
                site.call_site(),
                site.objects_diagnosed(),
                site.best_score()
            )?;
            for object in site.top_objects() {
                write_object(object, out)?;
            }
        }
        Ok(())
    })
}

fn write_object<W: Write>(object: &ObjectDiagnosis, out: &mut W) -> io::Result<()> {
    writeln!(
        out,
        "  object {} size {} score {}",
        object.object.start, object.object.size, object.score()
    )?;
    writeln!(
        out,
        "    invalidations: {} in first-touch thread, {} in other threads",
        object.invalidations_in_first_touch_thread, object.invalidations_in_other_threads
    )?;
    writeln!(
        out,
        "    accesses:      {} by first-touch thread, {} by other threads",
        object.accesses_in_first_touch_thread, object.accesses_in_other_threads
    )?;
    writeln!(
        out,
        "    threads:       {:#b} ({} distinct)",
        object.access_threads,
        object.access_threads.count_ones()
    )?;
    for line in object.top_cache_lines.sorted() {
        write_cache_line(line, out)?;
    }
    for page in object.top_pages.sorted() {
        write_page(page, out)?;
    }
    Ok(())
}

fn write_cache_line<W: Write>(line: &CacheLineSummary, out: &mut W) -> io::Result<()> {
    write!(
        out,
        "    cache line {}: {} invalidations ({} first-touch, {} others), {} reads, {} writes, threads {:#b}",
        line.start,
        line.invalidations(),
        line.invalidations_by_first_touch_thread,
        line.invalidations_by_other_threads,
        line.reads,
        line.writes,
        line.access_threads
    )?;
    match &line.word_threads {
        Some(masks) => {
            write!(out, ", words [")?;
            for (i, mask) in masks.iter().enumerate() {
                if i > 0 {
                    write!(out, " ")?;
                }
                write!(out, "{:#x}", mask)?;
            }
            writeln!(out, "]")
        }
        None => writeln!(out),
    }
}

fn write_page<W: Write>(page: &PageDiagnosis, out: &mut W) -> io::Result<()> {
    let cause = match page.cause {
        SharingCause::Allocator => "allocator-induced",
        SharingCause::Application => "application-induced",
    };
    writeln!(
        out,
        "    page {}: {}, page threads {:#b}, object threads {:#b}, first-touch accesses {} on page / {} on object",
        page.page,
        cause,
        page.access_threads_in_page,
        page.access_threads_from_object,
        page.page_accesses_by_first_touch_thread,
        page.object_accesses_by_first_touch_thread
    )
}
